mod mqtt;
mod router;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cul_serial::{doctor as cul_doctor, version, CulConfig, DryRunSink, FrameSink, SerialTransport};
use cul_somfy::{doctor as somfy_doctor, record, Publisher, ShutterProtocolHandler, SomfyConfig};

use crate::mqtt::{MqttCfg, MqttPublisher};
use crate::router::{Inbound, Router};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const VERSION_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "cul2mqtt", version, about = "Bidirectional CUL to MQTT gateway")]
struct Cli {
    #[arg(long, default_value = "cul2mqtt.toml")]
    config: PathBuf,

    /// Log at info level unless RUST_LOG says otherwise.
    #[arg(long, short)]
    verbose: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config, the state directory and the CUL device.
    Doctor,
    /// Run the gateway until Ctrl-C or SIGTERM.
    Run,
    /// Ask the CUL for its firmware version.
    Version,
    /// List the stored shutter records.
    Devices,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(default = "default_state_dir")]
    state_dir: PathBuf,
    /// Append the log here instead of writing it to stderr.
    log_file: Option<PathBuf>,
    #[serde(default)]
    cul: CulConfig,
    #[serde(default)]
    mqtt: MqttCfg,
    #[serde(default)]
    somfy: SomfyConfig,
}

fn default_prefix() -> String { "homeassistant".into() }
fn default_state_dir() -> PathBuf { PathBuf::from("state") }

fn load_config(path: &PathBuf) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(s).context("parse config toml")?;
    anyhow::ensure!(
        !cfg.prefix.is_empty() && !cfg.prefix.ends_with('/'),
        "prefix must be non-empty and without a trailing '/'"
    );
    Ok(cfg)
}

fn init_logging(cli: &Cli, log_file: Option<&PathBuf>) -> Result<()> {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "error"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_logging(&cli, cfg.log_file.as_ref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Run => run(&cfg).await?,
        Command::Version => version_cmd(&cfg).await?,
        Command::Devices => devices(&cfg)?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    cul_doctor::check_device(&cfg.cul)?;
    mqtt::check(&cfg.mqtt)?;

    if cfg.somfy.enabled {
        somfy_doctor::check_config(&cfg.somfy)?;
        let n = somfy_doctor::check_records(&cfg.state_dir)?;
        info!("doctor: {} somfy records", n);
    } else {
        warn!("doctor: somfy disabled, nothing to control");
    }

    info!("doctor: OK");
    println!("OK");
    Ok(())
}

async fn version_cmd(cfg: &Config) -> Result<()> {
    anyhow::ensure!(!cfg.cul.dry_run, "cul.dry_run is set, there is no device to ask");
    let cul = cfg.cul.clone();
    let v = tokio::task::spawn_blocking(move || version::query_version(&cul, VERSION_WAIT))
        .await
        .context("version query task")??;
    println!("{}", v);
    Ok(())
}

fn devices(cfg: &Config) -> Result<()> {
    for (path, rec) in record::load_all(&cfg.state_dir)? {
        println!(
            "{} {:?} class={} rc={:04X} key={:X} up={:?} down={:?} pos={:?} ({})",
            rec.address,
            rec.name,
            rec.device_class,
            rec.rolling_code,
            rec.enc_key,
            rec.up_time,
            rec.down_time,
            rec.current_pos,
            path.display(),
        );
    }
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("run: shutdown requested");
            cancel.cancel();
        });
    }

    let serial = if cfg.cul.dry_run {
        warn!("run: dry run, frames are logged and nothing is received");
        None
    } else {
        Some(Arc::new(SerialTransport::open(&cfg.cul)?))
    };
    let sink: Arc<dyn FrameSink> = match &serial {
        Some(cul) => cul.clone() as Arc<dyn FrameSink>,
        None => Arc::new(DryRunSink),
    };

    let (client, events) = mqtt::connect(&cfg.mqtt);
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(client.clone()));

    let somfy = if cfg.somfy.enabled {
        let handler = ShutterProtocolHandler::load(&cfg.somfy, &cfg.prefix, &cfg.state_dir, sink, publisher)
            .context("load somfy records")?;
        Some(Arc::new(handler))
    } else {
        None
    };
    let mut halt = somfy.as_ref().map(|h| h.halt_signal());
    let router = Router::new(&cfg.prefix, somfy);

    let (tx, mut rx) = mpsc::channel::<Inbound>(64);
    let mqtt_task = tokio::spawn(mqtt::session(client, events, cfg.prefix.clone(), tx.clone(), cancel.clone()));
    let rf_task = match &serial {
        Some(cul) => Some(spawn_rf_reader(cul, tx.clone(), cancel.clone())?),
        None => None,
    };
    drop(tx);

    let mut result = Ok(());
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = halted(&mut halt) => {
                error!("run: CUL write failed, stopping");
                result = Err(anyhow::anyhow!("CUL transmitter halted after a failed write"));
                break;
            }
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        if let Err(e) = router.handle(msg).await {
            error!("run: {:#}", e);
            result = Err(e);
            break;
        }
    }
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_DRAIN, router.shutdown()).await.is_err() {
        warn!("run: state not fully saved within {:?}", SHUTDOWN_DRAIN);
    }
    join_logged("mqtt session", mqtt_task).await;
    if let Some(t) = rf_task {
        join_logged("rf reader", t).await;
    }

    info!("run: stopped");
    result
}

/// Waits for a background task; a panic or cancellation is logged, not raised.
async fn join_logged(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            error!("run: {} task failed: {}", name, e);
            false
        }
    }
}

/// Resolves once the handler has latched a failed write; never without one.
async fn halted(rx: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = rx {
        if rx.wait_for(|h| *h).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// The CUL read loop blocks, so it gets its own thread and forwards lines.
fn spawn_rf_reader(
    cul: &SerialTransport,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let lines = cul.lines(cancel)?;
    info!("rf: listening on {}", cul.device());
    Ok(tokio::task::spawn_blocking(move || {
        for line in lines {
            if tx.blocking_send(Inbound::Rf(line)).is_err() {
                break;
            }
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("run: cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("run: cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
