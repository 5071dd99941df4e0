use std::{ fs, io::Write, path::PathBuf };

use anyhow::{ Context, Result };
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::{ fs::OpenOptions, io::AsyncWriteExt };
use tracing::debug;

use crate::event::Incident;

/// Where accepted incidents go. A cycle only stores its cursor after the sink
/// has taken every incident.
#[async_trait]
pub trait IncidentSink: Send + Sync {
    async fn deliver(&self, instance: &str, incidents: &[Incident]) -> Result<()>;
}

fn to_line(instance: &str, incident: &Incident) -> Result<String> {
    let v = json!({ "instance": instance, "incident": incident });
    Ok(serde_json::to_string(&v)?)
}

/// JSON lines on stdout.
#[derive(Default)]
pub struct StdoutSink {
    lock: Mutex<()>,
}

#[async_trait]
impl IncidentSink for StdoutSink {
    async fn deliver(&self, instance: &str, incidents: &[Incident]) -> Result<()> {
        let mut buf = String::new();
        for i in incidents {
            buf.push_str(&to_line(instance, i)?);
            buf.push('\n');
        }
        let _guard = self.lock.lock();
        let mut out = std::io::stdout().lock();
        out.write_all(buf.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// Appends JSON lines to `<dir>/<instance>.incidents.jsonl`.
pub struct FileSink {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileSink {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).context(format!("cannot create output directory {:?}", dir))?;
        Ok(FileSink { dir, lock: tokio::sync::Mutex::new(()) })
    }

    pub fn path(&self, instance: &str) -> PathBuf {
        let name: String = instance
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.incidents.jsonl", name))
    }
}

#[async_trait]
impl IncidentSink for FileSink {
    async fn deliver(&self, instance: &str, incidents: &[Incident]) -> Result<()> {
        if incidents.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for i in incidents {
            buf.push_str(&to_line(instance, i)?);
            buf.push('\n');
        }
        let path = self.path(instance);
        let _guard = self.lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path).await
            .context(format!("cannot open {:?}", path))?;
        f.write_all(buf.as_bytes()).await.context(format!("cannot write to {:?}", path))?;
        f.flush().await.context(format!("cannot flush {:?}", path))?;
        debug!(instance, count = incidents.len(), "incidents written to {:?}", path);
        Ok(())
    }
}
