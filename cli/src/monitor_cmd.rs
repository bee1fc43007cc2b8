//! `upscalebus monitor`: a standalone watcher feeding a remote bus.
//!
//! For deployments that separate watching from processing. The monitor
//! never touches ledgers or scratch space; it only watches roots and
//! pushes discovery events over the socket a bus opened with
//! `run --listen`. Delivery retries with backoff across bus restarts,
//! and because discovery is idempotent on the bus side, re-sending after
//! a reconnect needs no bookkeeping.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use upscalebus_core::BusConfig;
use upscalebus_core::config::RootConfig;
use upscalebus_core::events::EventEmitter;
use upscalebus_core::monitor::Monitor;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
pub struct MonitorArgs {
    /// Socket of the bus to feed (its `run --listen` address).
    #[arg(long, value_name = "SOCKET")]
    socket: PathBuf,

    /// Root directory to watch; repeatable, adds to any configured roots.
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,
}

pub async fn run(config_path: Option<&Path>, args: MonitorArgs) -> anyhow::Result<ExitCode> {
    let mut cfg = BusConfig::load(config_path).context("loading configuration")?;
    for path in &args.roots {
        if !cfg.roots.iter().any(|root| root.path == *path) {
            cfg.roots.push(RootConfig::new(path.clone()));
        }
    }
    cfg.validate_common()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // Watch first, scan second, so nothing lands between the two.
    let mut monitor = Monitor::new(&cfg).context("starting filesystem watcher")?;
    let mut emitter = None;

    let backlog = monitor.initial_scan().context("initial scan")?;
    info!(
        socket = %args.socket.display(),
        roots = cfg.roots.len(),
        backlog = backlog.len(),
        "monitor starting"
    );
    for path in &backlog {
        if !deliver(&mut emitter, &args.socket, &cancel, path).await {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let mut tick = tokio::time::interval(Duration::from_millis(100));
    'watch: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'watch,
            _ = tick.tick() => {
                if let Some(settled) = monitor.poll_settled() {
                    for path in settled {
                        if !deliver(&mut emitter, &args.socket, &cancel, &path).await {
                            break 'watch;
                        }
                    }
                }
            }
        }
    }

    info!("monitor stopped");
    Ok(ExitCode::SUCCESS)
}

/// Send one discovery, reconnecting as needed. Returns false only when
/// cancelled mid-retry; the path is then dropped, which is safe because
/// the bus rescans at startup anyway.
async fn deliver(
    emitter: &mut Option<EventEmitter>,
    socket: &Path,
    cancel: &CancellationToken,
    path: &Path,
) -> bool {
    loop {
        if emitter.is_none() {
            match connect_with_backoff(socket, cancel).await {
                Some(connected) => *emitter = Some(connected),
                None => return false,
            }
        }
        if let Some(connected) = emitter.as_mut() {
            match connected.emit_discovery(path).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(%err, "lost connection to bus, reconnecting");
                    *emitter = None;
                }
            }
        }
    }
}

async fn connect_with_backoff(socket: &Path, cancel: &CancellationToken) -> Option<EventEmitter> {
    let mut delay = RECONNECT_INITIAL;
    loop {
        match EventEmitter::connect(socket).await {
            Ok(emitter) => {
                info!(socket = %socket.display(), "connected to bus");
                return Some(emitter);
            }
            Err(err) => {
                warn!(socket = %socket.display(), %err, retry_in = ?delay, "bus not reachable");
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RECONNECT_CAP);
    }
}
