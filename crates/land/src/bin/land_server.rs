use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use land::start_status_server;
use land_node::{HttpDecisionOracle, LandConfig, LandRuntime};
use land_store::LocalDocumentStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STATUS_BIND: &str = "127.0.0.1:8080";
const DEFAULT_STORE_ROOT: &str = "output/land-store";
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    status_bind: String,
    store_root: PathBuf,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            status_bind: DEFAULT_STATUS_BIND.to_string(),
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
        }
    }
}

fn main() {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    if raw_args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return;
    }

    let options = match parse_options(raw_args.iter().map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            process::exit(1);
        }
    };

    init_tracing();
    if let Err(err) = run_land_server(options) {
        error!(error = %err, "land_server failed");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_land_server(options: CliOptions) -> Result<(), String> {
    let config = match options.config_path.as_deref() {
        Some(path) => LandConfig::from_config_file(path),
        None => LandConfig::from_default_sources(),
    }
    .map_err(|err| format!("failed to load config: {err}"))?;

    let store = LocalDocumentStore::open(&options.store_root).map_err(|err| {
        format!(
            "failed to open store at {}: {err}",
            options.store_root.display()
        )
    })?;
    let oracle = HttpDecisionOracle::from_config(&config.oracle)
        .map_err(|err| format!("failed to build oracle client: {err}"))?;
    info!(
        world_id = %config.world_id,
        oracle = %oracle.endpoint(),
        store_root = %store.root().display(),
        "land_server configured"
    );

    let mut runtime = LandRuntime::new(config, Arc::new(store), Arc::new(oracle));
    runtime
        .start()
        .map_err(|err| format!("failed to start land runtime: {err}"))?;
    let mut status_server = start_status_server(&options.status_bind, runtime.status_handle())
        .map_err(|err| {
            stop_runtime(&mut runtime);
            err
        })?;
    info!(status = %format!("http://{}/status", status_server.local_addr()), "land_server ready");

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|err| format!("failed to install Ctrl+C handler: {err}"))?;

    let outcome = loop {
        if let Some(fatal) = runtime.wait_fatal_error(SUPERVISE_INTERVAL) {
            break Err(format!("{fatal}"));
        }
        if let Some(err) = status_server.poll_error() {
            break Err(err);
        }
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                info!("shutdown requested");
                break Ok(());
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }
    };

    status_server.stop();
    stop_runtime(&mut runtime);
    outcome
}

fn stop_runtime(runtime: &mut LandRuntime) {
    if let Err(err) = runtime.stop() {
        warn!(error = %err, "failed to stop land runtime");
    }
}

fn parse_options<'a>(args: impl Iterator<Item = &'a str>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.peekable();

    while let Some(arg) = iter.next() {
        match arg {
            "--config" => {
                let raw = parse_required_value(&mut iter, "--config")?;
                options.config_path = Some(PathBuf::from(raw));
            }
            "--status-bind" => {
                options.status_bind = parse_required_value(&mut iter, "--status-bind")?;
            }
            "--store-root" => {
                let raw = parse_required_value(&mut iter, "--store-root")?;
                options.store_root = PathBuf::from(raw);
            }
            _ => return Err(format!("unknown option: {arg}")),
        }
    }

    validate_host_port(options.status_bind.as_str(), "--status-bind")?;
    if let Some(path) = options.config_path.as_deref() {
        if !Path::new(path).exists() {
            return Err(format!("--config file not found: {}", path.display()));
        }
    }
    Ok(options)
}

fn parse_required_value<'a, I>(
    iter: &mut std::iter::Peekable<I>,
    flag: &str,
) -> Result<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let Some(value) = iter.next() else {
        return Err(format!("{flag} requires a value"));
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{flag} requires a non-empty value"));
    }
    Ok(value.to_string())
}

fn validate_host_port(raw: &str, label: &str) -> Result<(), String> {
    let trimmed = raw.trim();
    let (host, port_text) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| format!("{label} must be in <host:port> format"))?;
    if host.trim().is_empty() {
        return Err(format!("{label} host cannot be empty"));
    }
    port_text
        .parse::<u16>()
        .map_err(|_| format!("{label} port must be an integer in 0..=65535"))?;
    Ok(())
}

fn print_help() {
    println!(
        "Usage: land_server [options]\n\n\
Runs the land world core: player and field watchers, passivity sweep and\n\
monster control, plus a read-only debug HTTP surface.\n\n\
Options:\n\
  --config <path>             config file with LAND_* keys (default: config.toml if present, else env)\n\
  --status-bind <host:port>   debug HTTP bind (default: {DEFAULT_STATUS_BIND})\n\
  --store-root <dir>          local document store directory (default: {DEFAULT_STORE_ROOT})\n\
  -h, --help                  show help\n\n\
The store is a local snapshot: <store-root>/*.json is read once at startup and\n\
rewritten after each write. Edits made to those files by other processes while\n\
the server runs are not seen, so player positions only arrive through writes\n\
made by this process.\n\n\
Logging follows RUST_LOG (default: info)."
    );
}
