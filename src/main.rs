use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use minginx::{logging, Config, Proxy};
use tokio::runtime;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "minginx", version, about = "A small config-driven reverse HTTP proxy")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "proxy.yml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("can't load config {}", args.config.display()))?;
    let _guard = logging::init(&config.log).context("can't set up logging")?;

    let mut builder = runtime::Builder::new_multi_thread();
    if let Some(workers) = config.proxy.workers {
        builder.worker_threads(workers);
    }
    let rt = builder
        .enable_all()
        .thread_name("minginx-worker")
        .build()
        .context("can't build the tokio runtime")?;

    rt.block_on(async {
        let proxy = Proxy::bind(&config).await.context("can't start the proxy")?;
        info!("minginx started with {} server(s)", proxy.servers().len());
        tokio::select! {
            result = proxy.run() => result.context("proxy stopped"),
            signal = tokio::signal::ctrl_c() => {
                signal.context("can't listen for ctrl-c")?;
                warn!("Received ctrl-c, shutting down");
                Ok(())
            }
        }
    })
}
