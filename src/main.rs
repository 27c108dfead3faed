//! slotserve - single-slot inference server
//!
//! Loads one GGUF model and serves completions over HTTP.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slotserve::inference::llama;
use slotserve::server::{run_server, AppState};
use slotserve::storage::{load_settings, save_settings, ServerSettings};
use slotserve::system::ServerMetrics;

/// Single-slot HTTP inference server for GGUF models
#[derive(Debug, Parser)]
#[command(name = "slotserve", version)]
struct Cli {
    /// Path to the GGUF model.
    #[arg(value_name = "MODEL")]
    model_path: Option<PathBuf>,

    /// Path to the GGUF model (same as the positional argument).
    #[arg(short = 'm', long = "model", conflicts_with = "model_path")]
    model: Option<PathBuf>,

    /// Context size in tokens.
    #[arg(short = 'c', long = "ctx-size")]
    ctx_size: Option<u32>,

    /// Number of layers to offload to the GPU.
    #[arg(long = "ngl", alias = "n-gpu-layers")]
    gpu_layers: Option<u32>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Maximum tokens generated per request (0 = unbounded).
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature (below 0.01 samples greedily).
    #[arg(long = "temp")]
    temperature: Option<f32>,

    /// Settings file to read instead of the platform default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the settings file.
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    /// Command line values win over the settings file.
    fn apply(&self, settings: &mut ServerSettings) {
        if let Some(path) = self.model_path.as_ref().or(self.model.as_ref()) {
            settings.model_path = Some(path.clone());
        }
        if let Some(ctx_size) = self.ctx_size {
            settings.context_size = ctx_size;
        }
        if let Some(gpu_layers) = self.gpu_layers {
            settings.gpu_layers = gpu_layers;
        }
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            settings.sampling.temperature = temperature;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("slotserve=info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("Starting slotserve v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = load_settings(cli.config.as_deref());
    cli.apply(&mut settings);
    settings.validate();

    if cli.save_config {
        let path = save_settings(&settings, cli.config.as_deref())?;
        info!("Saved settings to {}", path.display());
    }

    let metrics = ServerMetrics::shared();

    // Model loading blocks for seconds; keep it off the async workers.
    let engine = {
        let settings = settings.clone();
        let metrics = metrics.clone();
        tokio::task::spawn_blocking(move || llama::spawn(&settings, metrics)).await??
    };

    let addr = tokio::net::lookup_host((settings.host.as_str(), settings.port))
        .await?
        .next()
        .ok_or("listen address did not resolve")?;

    run_server(AppState::new(engine, metrics), addr).await?;
    info!("Server stopped");
    Ok(())
}
