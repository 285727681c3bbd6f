//! erd-stream - Main Entry Point
//!
//! ```text
//! erd-stream [CONFIG]                      run a streaming session
//! erd-stream analyze DIR SESSION [CONFIG]  per-category ERD of a persisted session
//! erd-stream init-config [PATH]            write the default configuration
//! ```
//!
//! While a session runs, pressing Enter stops it.

use anyhow::{bail, Context};
use crossbeam_channel::{bounded, Receiver};
use erd_stream::{
    analysis::{calculate_erd_across_trials, ErdCalculator},
    config::{LoggingSettings, SessionConfig, DEFAULT_CONFIG_FILE},
    pipeline::{Session, SessionMessage},
    session::RecordedSession,
    types::StreamInfo,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,erd_stream=debug";

fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(settings.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "erd-stream.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn load_config(path: Option<&str>) -> anyhow::Result<SessionConfig> {
    let path = path.unwrap_or(DEFAULT_CONFIG_FILE);
    let config = SessionConfig::load_or_default(path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;
    Ok(config)
}

/// Signal on a channel whenever a line is read from stdin.
fn stdin_stop_signal() -> Receiver<()> {
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        while let Ok(n) = stdin.lock().read_line(&mut line) {
            if n == 0 {
                break;
            }
            let _ = tx.try_send(());
            line.clear();
        }
    });
    rx
}

fn run_session(config: SessionConfig) -> anyhow::Result<()> {
    let session = Session::from_config(config)?;
    if let Some(addr) = session.broadcast_addr() {
        tracing::info!("Consumers can connect to {}", addr);
    }
    let handle = session.spawn()?;
    let stop_rx = stdin_stop_signal();
    tracing::info!("Press Enter to stop");

    while !handle.is_finished() {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Stopping...");
            handle.stop();
        }
        match handle.bridge().recv_timeout(Duration::from_millis(200)) {
            Some(SessionMessage::Result(result)) => {
                tracing::info!(
                    "{} @ {}: ERD {}",
                    result.marker_description,
                    result.marker_stream_pos,
                    result
                        .erd_mean
                        .map(|v| format!("{:.1}%", v))
                        .unwrap_or_else(|| "undefined".to_string())
                );
            }
            Some(SessionMessage::Stats(stats)) => {
                tracing::debug!(
                    "{} samples, {} markers, {} results, {} consumers",
                    stats.samples,
                    stats.markers,
                    stats.results,
                    stats.consumers
                );
            }
            Some(_) | None => {}
        }
    }

    let summary = handle.join()?;
    println!(
        "Session '{}': {} results, {} overruns, {} computation failures, persistence {}",
        summary.session,
        summary.results(),
        summary.overruns(),
        summary.computation_failures(),
        if summary.persistence.complete {
            "complete"
        } else {
            "INCOMPLETE"
        }
    );
    if let Some(failure) = summary.failure {
        bail!("Session failed: {}", failure);
    }
    Ok(())
}

fn analyze(config: &SessionConfig, dir: &Path, session: &str) -> anyhow::Result<()> {
    let recording = RecordedSession::load(dir, session)?;
    let names = config.bind_stream(&StreamInfo {
        sample_rate: recording.sample_rate(),
        channel_names: recording.channel_names().to_vec(),
    })?;
    let mut calculator = ErdCalculator::new(config, names)?;
    let categories =
        calculate_erd_across_trials(&mut calculator, config, &recording.data, &recording.markers);

    println!(
        "{} ({:.1} s, {} markers), method: {}",
        session,
        recording.metadata.duration_seconds(),
        recording.markers.len(),
        calculator.method()
    );
    let fmt_erd = |v: Option<f64>| v.map(|v| format!("{:8.2}%", v)).unwrap_or_else(|| "     n/a".into());
    for c in categories {
        println!(
            "  {:<16} trials {:>4}  defined {:>4}  failed {:>4}  mean {}  power-avg {}",
            c.category,
            c.trials,
            c.defined,
            c.failed,
            fmt_erd(c.mean_erd),
            fmt_erd(c.power_averaged_erd)
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("init-config") => {
            let path = PathBuf::from(args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_FILE));
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            SessionConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Some("analyze") => {
            let (Some(dir), Some(session)) = (args.get(1), args.get(2)) else {
                bail!("usage: erd-stream analyze DIR SESSION [CONFIG]");
            };
            let config = load_config(args.get(3).map(String::as_str))?;
            let _guard = init_logging(&config.logging);
            analyze(&config, Path::new(dir), session)
        }
        path => {
            let config = load_config(path)?;
            let _guard = init_logging(&config.logging);
            tracing::info!("Starting erd-stream");
            run_session(config)
        }
    }
}
