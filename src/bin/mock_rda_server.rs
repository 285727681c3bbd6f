//! Mock RDA server
//!
//! ```text
//! mock-rda-server [--port 51244] [--channels 8] [--rate 500] [--duration SECONDS]
//! ```

use anyhow::{bail, Context};
use erd_stream::config::DEFAULT_RDA_PORT;
use erd_stream::source::mock_server::{MockRdaServer, MockServerConfig};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut port = DEFAULT_RDA_PORT;
    let mut config = MockServerConfig::default();

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .with_context(|| format!("{} needs a value", flag))?;
        match flag.as_str() {
            "--port" => port = value.parse().context("invalid --port")?,
            "--rate" => config.sample_rate = value.parse().context("invalid --rate")?,
            "--duration" => {
                let secs: f64 = value.parse().context("invalid --duration")?;
                config.duration = Some(Duration::from_secs_f64(secs));
            }
            "--channels" => {
                let n: usize = value.parse().context("invalid --channels")?;
                if n == 0 {
                    bail!("--channels must be at least 1");
                }
                config.channel_names = (1..=n).map(|i| format!("Ch{}", i)).collect();
            }
            other => bail!("unknown option {}", other),
        }
    }
    config.chunk = ((config.sample_rate / 10.0).round() as usize).max(1);

    let server = MockRdaServer::start(("127.0.0.1", port), config)?;
    tracing::info!("Serving on {}; Ctrl-C to quit", server.local_addr());
    while server.is_running() {
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}
