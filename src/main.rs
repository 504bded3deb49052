use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use faultline::{
    RecoveryLayer, api,
    config::{Config, LogFormat},
    system,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "FAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.server.listen = listen;
    }

    init_tracing(cfg.log_format);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(cfg))
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("faultline=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
            registry.with(fmt_layer).init();
        }
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let cors = CorsLayer::very_permissive()
        // https://github.com/tower-rs/tower-http/issues/194
        .allow_origin(AllowOrigin::mirror_request())
        .max_age(Duration::from_secs(86400));

    let router = api::router(RecoveryLayer::from_config(&cfg.recovery), cfg.body.limit).layer(cors);

    let listener = tokio::net::TcpListener::bind(cfg.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen))?;
    tracing::info!("listening on {}", cfg.server.listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            system::wait_for_signal().await;
            tracing::info!("shutting down gracefully...");
        })
        .await
        .context("http server error")?;

    Ok(())
}
