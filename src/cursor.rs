use std::{ collections::{ BTreeSet, HashMap }, fs, io::ErrorKind, path::PathBuf };

use anyhow::{ Context, Result };
use async_trait::async_trait;
use chrono::{ DateTime, SecondsFormat, Utc };
use parking_lot::Mutex;
use serde::{ Deserializer, Serializer };
use serde_derive::{ Deserialize, Serialize };
use tracing::debug;

use crate::utils;

/// Polling position: everything before `watermark` has been delivered, and of
/// the events stamped exactly at `watermark` only `seen_ids` have.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    #[serde(serialize_with = "serialize_watermark", deserialize_with = "deserialize_watermark")]
    pub watermark: DateTime<Utc>,
    #[serde(default)]
    pub seen_ids: BTreeSet<String>,
}

impl Cursor {
    pub fn new(watermark: DateTime<Utc>) -> Self {
        Cursor { watermark, seen_ids: BTreeSet::new() }
    }

    pub fn has_seen(&self, t: &DateTime<Utc>, id: &str) -> bool {
        *t == self.watermark && self.seen_ids.contains(id)
    }

    /// Records a delivered event. A later time moves the watermark and drops
    /// the ids collected at the previous one; an earlier time leaves the
    /// cursor alone so the watermark never regresses.
    pub fn advance(&mut self, t: DateTime<Utc>, id: &str) {
        if t > self.watermark {
            self.watermark = t;
            self.seen_ids.clear();
        }
        if t == self.watermark {
            self.seen_ids.insert(id.to_string());
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("cannot parse stored cursor")
    }
}

fn serialize_watermark<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer
{
    // full precision: the watermark is compared for equality with parsed event times
    serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn deserialize_watermark<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where D: Deserializer<'de>
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Opaque per-instance cursor storage owned by whoever schedules the polls.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, instance: &str) -> Result<Option<Cursor>>;
    async fn set(&self, instance: &str, cursor: &Cursor) -> Result<()>;
}

/// One `<instance>.cursor.json` file per instance.
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).context(format!("cannot create state directory {:?}", dir))?;
        Ok(FileCursorStore { dir })
    }

    fn path(&self, instance: &str) -> PathBuf {
        let name: String = instance
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.cursor.json", name))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn get(&self, instance: &str) -> Result<Option<Cursor>> {
        let path = self.path(instance);
        let s = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(instance, "no stored cursor at {:?}", path);
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(format!("cannot read cursor file {:?}", path));
            }
        };
        Ok(Some(Cursor::from_json(&s)?))
    }

    async fn set(&self, instance: &str, cursor: &Cursor) -> Result<()> {
        let path = self.path(instance);
        let tmp = path.with_extension("json.tmp");
        let json = cursor.to_json()?;
        tokio::fs::write(&tmp, json).await.context(format!("cannot write cursor file {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path).await.context(format!("cannot replace cursor file {:?}", path))?;
        debug!(instance, watermark = %utils::format_timestamp(&cursor.watermark), "cursor stored");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, instance: &str) -> Result<Option<Cursor>> {
        Ok(self.cursors.lock().get(instance).cloned())
    }

    async fn set(&self, instance: &str, cursor: &Cursor) -> Result<()> {
        self.cursors.lock().insert(instance.to_string(), cursor.clone());
        Ok(())
    }
}
