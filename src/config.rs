use std::{ collections::HashSet, fs, path::Path, time::Duration as StdDuration };

use anyhow::{ anyhow, Context, Result };
use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_derive::Deserialize;
use tracing::{ info, warn };

use crate::poller::{ PollerConfig, MAX_PAGE_SIZE };

const INSTANCE_GLOB: &str = "instances_*.json";
pub const DEFAULT_FIRST_FETCH: &str = "3 days";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Zimperium,
    Darktrace,
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Vendor::Zimperium => write!(f, "zimperium"),
            Vendor::Darktrace => write!(f, "darktrace"),
        }
    }
}

/// How to reach a vendor API.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub api_key: String,
    pub insecure: bool,
    pub timeout: StdDuration,
}

/// One configured integration instance, as read from `instances_*.json`.
#[derive(Deserialize, Clone, Debug)]
pub struct InstanceConfig {
    pub name: String,
    pub vendor: Vendor,
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_first_fetch")]
    pub first_fetch: String,
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Deserialize)]
struct InstanceFile {
    instances: Vec<InstanceConfig>,
}

fn default_true() -> bool {
    true
}
fn default_first_fetch() -> String {
    DEFAULT_FIRST_FETCH.to_string()
}
fn default_max_fetch() -> usize {
    MAX_PAGE_SIZE
}
fn default_interval() -> u64 {
    60
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl InstanceConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            base_url: self.url.clone(),
            api_key: self.api_key.clone(),
            insecure: self.insecure,
            timeout: StdDuration::from_secs(self.timeout_secs),
        }
    }

    pub fn poller_config(&self) -> Result<PollerConfig> {
        PollerConfig::new(parse_lookback(&self.first_fetch)?, self.max_fetch, self.verbose).context(
            format!("invalid fetch settings for instance {}", self.name)
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !INSTANCE_NAME_RE.is_match(&self.name) {
            return Err(
                anyhow!(
                    "instance name {:?} must be non-empty and use only letters, digits, '-' and '_'",
                    self.name
                )
            );
        }
        if self.url.trim().is_empty() {
            return Err(anyhow!("instance {} has no url", self.name));
        }
        if self.interval_secs == 0 {
            return Err(anyhow!("instance {} has a zero polling interval", self.name));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(anyhow!("instance {} min_score must be between 0 and 1", self.name));
        }
        self.poller_config()?;
        Ok(())
    }
}

static LOOKBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(\d+)\s*(second|sec|minute|min|hour|day|week|month|year)s?(\s+ago)?\s*$"
    ).unwrap()
});

static INSTANCE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Parses lookbacks such as "3 days", "1 day ago", "12 hours" or "2 weeks".
/// Months count as 30 days and years as 365.
pub fn parse_lookback(s: &str) -> Result<Duration> {
    let caps = LOOKBACK_RE.captures(s).ok_or_else(|| anyhow!("cannot parse time range {:?}", s))?;
    let n: u64 = caps[1].parse().context(format!("time range {:?} is too large", s))?;
    let unit_secs: u64 = match caps[2].to_lowercase().as_str() {
        "second" | "sec" => 1,
        "minute" | "min" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 7 * 86_400,
        "month" => 30 * 86_400,
        _ => 365 * 86_400,
    };
    let secs = n.checked_mul(unit_secs).ok_or_else(|| anyhow!("time range {:?} is too large", s))?;
    Duration::from_std(StdDuration::from_secs(secs)).map_err(|_| anyhow!("time range {:?} is too large", s))
}

pub fn load_instances(cfg_dir: &Path) -> Result<Vec<InstanceConfig>> {
    let glob_pattern = cfg_dir.to_string_lossy().to_string() + "/" + INSTANCE_GLOB;
    let mut instances = vec![];
    let mut names = HashSet::new();
    for file_path in glob::glob(&glob_pattern)?.flatten() {
        info!("reading {:?}", file_path);
        let s = fs::read_to_string(&file_path).context(format!("cannot read {:?}", file_path))?;
        let loaded: InstanceFile = serde_json
            ::from_str(&s)
            .context(format!("cannot parse {:?}", file_path))?;
        for i in loaded.instances {
            if !i.enabled {
                warn!(instance = %i.name, "instance is disabled, skipping it");
                continue;
            }
            i.validate()?;
            if !names.insert(i.name.clone()) {
                return Err(anyhow!("duplicate instance name {}", i.name));
            }
            instances.push(i);
        }
    }
    info!("loaded {} integration instances", instances.len());
    Ok(instances)
}
