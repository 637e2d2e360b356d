use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sigma_core::{DeviceMap, GenerationService, PixArtLoader};
use tokio::{self, net::TcpListener};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod error;
mod routes;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "PixArt-Sigma image generation server")]
struct Args {
    /// Run on the best available accelerator instead of the CPU
    #[arg(long)]
    gpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sigma_server=info,sigma_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let device_map = if args.gpu {
        DeviceMap::Ordinal(0)
    } else {
        DeviceMap::ForceCpu
    };

    let service = Arc::new(GenerationService::new(PixArtLoader::new()?, device_map));

    // A failed load is retried by the first request.
    if let Err(e) = service.initialize().await {
        error!("Pipeline initialization failed, serving without it: {e}");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(service)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Started server on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
