use std::{ path::PathBuf, sync::Arc, time::Duration };

use anyhow::{ anyhow, Error, Result };
use clap::{ Args, Parser, Subcommand };
use tokio::sync::broadcast;
use tracing::{ error, info };

use crate::{
    command::CommandOutput,
    config::{ ConnectionConfig, InstanceConfig, Vendor },
    cursor::FileCursorStore,
    darktrace::commands::DarktraceCommand,
    sink::{ FileSink, IncidentSink, StdoutSink },
    zimperium::commands::ZimperiumCommand,
};

mod command;
mod config;
mod cursor;
mod darktrace;
mod event;
mod http;
mod logger;
mod poller;
mod runner;
mod sink;
mod table;
mod timestamp;
mod utils;
mod zimperium;

#[derive(Parser)]
#[command(
    version,
    about = "Incident feed for Zimperium and Darktrace",
    long_about = "Incident feed for Zimperium and Darktrace\n\n\
    Polls the vendor APIs for new events and model breaches, turns them into incidents\n\
    without duplicates across runs, and exposes the vendor lookup and triage commands."
)]
struct Cli {
    #[command(subcommand)]
    subcommand: SubCommands,
    /// Increase logging verbosity
    #[arg(short('v'), long, action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Log in JSON format
    #[arg(long = "log-json", env = "FEED_LOG_JSON", default_value_t = false)]
    log_json: bool,
    /// Write logs to daily rotated files in this directory instead of stderr
    #[arg(long = "log-dir", env = "FEED_LOG_DIR", value_name = "dir")]
    log_dir: Option<PathBuf>,
    /// Print command results as JSON instead of markdown
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum SubCommands {
    #[command(about = "Zimperium commands", name = "zimperium")] Zimperium(ZimperiumArgs),
    #[command(about = "Darktrace commands", name = "darktrace")] Darktrace(DarktraceArgs),
    #[command(
        about = "Poll every configured instance until interrupted",
        long_about = "Poll every instance in <config-dir>/instances_*.json on its own interval,\n\
        keeping one cursor file per instance in the state directory",
        name = "watch"
    )] Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Vendor API base URL
    #[arg(short('u'), long, env = "FEED_URL", value_name = "url")]
    url: String,
    /// Vendor API key
    #[arg(short('k'), long = "api-key", env = "FEED_API_KEY", value_name = "string", hide_env_values = true)]
    api_key: String,
    /// Skip TLS certificate verification
    #[arg(long, env = "FEED_INSECURE", default_value_t = false)]
    insecure: bool,
    /// Request timeout
    #[arg(long, env = "FEED_TIMEOUT", value_name = "seconds", default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
}

impl ConnectionArgs {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            base_url: self.url.clone(),
            api_key: self.api_key.clone(),
            insecure: self.insecure,
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// Instance name, used to key the stored cursor
    #[arg(short('n'), long, env = "FEED_INSTANCE", value_name = "string")]
    name: Option<String>,
    /// How far back to look on the first fetch
    #[arg(long = "first-fetch", env = "FEED_FIRST_FETCH", value_name = "e.g. 3 days", default_value = config::DEFAULT_FIRST_FETCH)]
    first_fetch: String,
    /// Max. incidents per fetch, capped at 50
    #[arg(long = "max-fetch", env = "FEED_MAX_FETCH", value_name = "number", default_value_t = poller::MAX_PAGE_SIZE)]
    max_fetch: usize,
    /// Keep the full vendor detail in each incident
    #[arg(long, default_value_t = false)]
    verbose: bool,
    /// Directory for cursor files, defaults to "state" next to the executable
    #[arg(long = "state-dir", env = "FEED_STATE_DIR", value_name = "dir")]
    state_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ZimperiumArgs {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[command(subcommand)]
    action: ZimperiumAction,
}

#[derive(Subcommand, Debug)]
enum ZimperiumAction {
    /// Check connectivity and credentials
    Test {
        /// Also check access to the events endpoint
        #[arg(long, default_value_t = false)]
        fetch: bool,
    },
    /// Fetch new events as incidents once, printed as JSON lines
    Fetch(FetchArgs),
    #[command(flatten)] Command(ZimperiumCommand),
}

#[derive(Args, Debug)]
struct DarktraceArgs {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[command(subcommand)]
    action: DarktraceAction,
}

#[derive(Subcommand, Debug)]
enum DarktraceAction {
    /// Check connectivity and credentials
    Test,
    /// Fetch new model breaches as incidents once, printed as JSON lines
    Fetch {
        #[command(flatten)]
        fetch: FetchArgs,
        /// Min. model breach score to fetch, 0 to 1
        #[arg(long = "min-score", env = "FEED_MIN_SCORE", value_name = "0 to 1", default_value_t = 0.0)]
        min_score: f64,
    },
    #[command(flatten)] Command(DarktraceCommand),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Directory holding instances_*.json, defaults to "configs" next to the executable
    #[arg(short('c'), long = "config-dir", env = "FEED_CONFIG_DIR", value_name = "dir")]
    config_dir: Option<PathBuf>,
    /// Directory for cursor files, defaults to "state" next to the executable
    #[arg(long = "state-dir", env = "FEED_STATE_DIR", value_name = "dir")]
    state_dir: Option<PathBuf>,
    /// Append incidents to <dir>/<instance>.incidents.jsonl instead of stdout
    #[arg(short('o'), long = "output-dir", env = "FEED_OUTPUT_DIR", value_name = "dir")]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let level = logger::verbosity_to_level_filter(args.verbosity);
    let (sub, _guard) = logger::setup_logger(level, args.log_json, args.log_dir.as_deref())?;
    tracing::subscriber::set_global_default(sub)?;
    run(args, false).await
}

fn log_startup_err(context: &str, err: Error) -> Error {
    error!("error {}: {:?}", context, err);
    err
}

fn print_output(out: &CommandOutput, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&out.to_json())?);
    } else {
        println!("{}", out.readable);
    }
    Ok(())
}

fn fetch_instance(vendor: Vendor, conn: &ConnectionArgs, fetch: &FetchArgs, min_score: f64) -> InstanceConfig {
    InstanceConfig {
        name: fetch.name.clone().unwrap_or_else(|| vendor.to_string()),
        vendor,
        url: conn.url.clone(),
        api_key: conn.api_key.clone(),
        enabled: true,
        insecure: conn.insecure,
        first_fetch: fetch.first_fetch.clone(),
        max_fetch: fetch.max_fetch,
        verbose: fetch.verbose,
        min_score,
        interval_secs: 1,
        timeout_secs: conn.timeout,
    }
}

async fn fetch_once(instance: InstanceConfig, state_dir: Option<PathBuf>, test_env: bool) -> Result<()> {
    instance.validate().map_err(|e| log_startup_err("reading fetch settings", e))?;
    let poller = runner::build_poller(&instance)?;
    let dir = match state_dir {
        Some(d) => d,
        None => utils::state_dir(test_env)?,
    };
    let store = FileCursorStore::new(dir)?;
    let count = runner::run_cycle(&instance.name, &poller, &store, &StdoutSink::default()).await?;
    info!(instance = %instance.name, count, "fetch finished");
    Ok(())
}

async fn run(args: Cli, test_env: bool) -> Result<()> {
    match args.subcommand {
        SubCommands::Zimperium(z) => {
            let client = zimperium::Client::new(&z.conn.connection())?;
            let out = match z.action {
                ZimperiumAction::Test { fetch } => zimperium::commands::test_module(&client, fetch).await?,
                ZimperiumAction::Fetch(f) => {
                    let i = fetch_instance(Vendor::Zimperium, &z.conn, &f, 0.0);
                    return fetch_once(i, f.state_dir, test_env).await;
                }
                ZimperiumAction::Command(cmd) => zimperium::commands::run(&client, cmd).await?,
            };
            print_output(&out, args.json)
        }
        SubCommands::Darktrace(d) => {
            let client = darktrace::Client::new(&d.conn.connection())?;
            let out = match d.action {
                DarktraceAction::Test => darktrace::commands::test_module(&client).await?,
                DarktraceAction::Fetch { fetch, min_score } => {
                    let i = fetch_instance(Vendor::Darktrace, &d.conn, &fetch, min_score);
                    return fetch_once(i, fetch.state_dir, test_env).await;
                }
                DarktraceAction::Command(cmd) => darktrace::commands::run(&client, cmd).await?,
            };
            print_output(&out, args.json)
        }
        SubCommands::Watch(w) => watch(w, test_env).await,
    }
}

async fn watch(w: WatchArgs, test_env: bool) -> Result<()> {
    let cfg_dir = match w.config_dir {
        Some(d) => d,
        None => utils::config_dir(test_env)?,
    };
    let state_dir = match w.state_dir {
        Some(d) => d,
        None => utils::state_dir(test_env)?,
    };
    info!("starting incident feed using configs in {:?}", cfg_dir);

    let instances = config
        ::load_instances(&cfg_dir)
        .map_err(|e| log_startup_err("loading instances", e))?;
    if instances.is_empty() {
        return Err(
            log_startup_err("loading instances", anyhow!("no enabled instances found in {:?}", cfg_dir))
        );
    }
    let scheduled = runner::schedule(&instances).map_err(|e| log_startup_err("building pollers", e))?;
    let store = Arc::new(
        FileCursorStore::new(state_dir).map_err(|e| log_startup_err("opening cursor store", e))?
    );
    let sink: Arc<dyn IncidentSink> = match w.output_dir {
        Some(d) => Arc::new(FileSink::new(d).map_err(|e| log_startup_err("opening output", e))?),
        None => Arc::new(StdoutSink::default()),
    };

    let (cancel_tx, _) = broadcast::channel::<()>(1);
    let tx = cancel_tx.clone();
    ctrlc
        ::set_handler(move || {
            info!("interrupt received, stopping");
            let _ = tx.send(());
        })
        .map_err(|e| log_startup_err("installing signal handler", anyhow!(e)))?;

    runner::watch(scheduled, store, sink, cancel_tx).await
}
