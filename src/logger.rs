use std::path::Path;

use anyhow::Result;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{ filter::LevelFilter, fmt::writer::BoxMakeWriter };

const LOG_FILE: &str = "incident-feed.log";

pub fn verbosity_to_level_filter(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Builds the global subscriber. Logs go to stderr so that command output on
/// stdout stays machine readable, or to a daily rolling file when `log_dir` is
/// given. The returned guard must be held until exit to flush the file writer.
pub fn setup_logger(
    level: LevelFilter,
    json: bool,
    log_dir: Option<&Path>
) -> Result<(Box<dyn Subscriber + Send + Sync>, Option<WorkerGuard>)> {
    let (writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (nb, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(nb), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let builder = tracing_subscriber
        ::fmt()
        .with_max_level(level)
        .with_ansi(log_dir.is_none())
        .with_writer(writer);
    let sub: Box<dyn Subscriber + Send + Sync> = if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    };
    Ok((sub, guard))
}
