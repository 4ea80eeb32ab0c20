use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tts_core::{PiperBackend, PiperVoice, SpeechModel, StreamingBridge, VoiceCatalog, VoiceLocator};

use server::config::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use server::handlers::START_TIME;
use server::{build_router, AppState};

const DEFAULT_TEXT: &str =
    "Hello world. This is a streaming text to speech server. Audio starts playing while the rest is still being generated.";

#[derive(Parser)]
#[command(name = "tts-server", version, about = "Streaming text-to-speech server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Preload the default voice and serve the HTTP API and web page.
    Serve(ServeArgs),
    /// Synthesize one text to a WAV file ("-" for stdout).
    Generate(GenerateArgs),
}

#[derive(Args)]
struct VoiceArgs {
    /// Preset name, http(s):// or hf:// reference, or path to a voice config.
    #[arg(long)]
    voice: Option<String>,

    /// Voice catalog mapping preset names to Piper configs.
    #[arg(long)]
    voice_map: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    voice: VoiceArgs,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    voice: VoiceArgs,

    #[arg(long, default_value = DEFAULT_TEXT)]
    text: String,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, default_value = "./tts_output.wav")]
    output_path: String,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let quiet = matches!(&cli.command, Command::Generate(args) if args.quiet);
    let filter = if quiet {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    // Logs go to stderr so `generate --output-path -` keeps stdout clean.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Generate(args) => generate(args),
    }
}

/// Load the catalog and the voice every request falls back to. Blocking:
/// runs before any async runtime exists.
fn load_model(args: &VoiceArgs, config: &ServerConfig) -> anyhow::Result<(Arc<PiperBackend>, VoiceCatalog, PiperVoice)> {
    let map_path = args.voice_map.clone().unwrap_or_else(|| config.voice_map.clone());
    let catalog = VoiceCatalog::from_file(&map_path)?;
    info!("Loaded {} voice(s) from {}", catalog.len(), map_path.display());

    let model = Arc::new(PiperBackend::new(catalog.clone(), config.voice_cache_dir.clone()));
    let locator = match &args.voice {
        Some(raw) => VoiceLocator::parse(raw, |name| model.is_preset(name)),
        None => model
            .default_locator()
            .context("voice map is empty and no --voice was given")?,
    };
    info!("Loading default voice {}", locator);
    let state = model
        .build_state(&locator, false)
        .with_context(|| format!("failed to load voice {locator}"))?;
    Ok((model, catalog, state))
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let _ = START_TIME.get_or_init(Instant::now);

    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let (model, catalog, default_state) = load_model(&args.voice, &config)?;
    let state = AppState::new(model, Arc::new(default_state), config.clone()).with_catalog(catalog);
    info!(
        "Server configuration loaded: rate_limit={}/min, request_timeout={}s, queue_capacity={}",
        config.rate_limit_per_minute, config.request_timeout_secs, config.stream_queue_capacity
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(async move {
        let app = build_router(state)?;
        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different --port."))?;

        info!("Server listening on http://{addr}");
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let (model, _catalog, state) = load_model(&args.voice, &config)?;

    let bridge = StreamingBridge::with_capacity(model, config.stream_queue_capacity);
    let summary = bridge
        .render_to_path(Arc::new(state), args.text, Path::new(&args.output_path))
        .with_context(|| format!("failed to write {}", args.output_path))?;

    if args.output_path != "-" {
        info!(
            "Results written in {} ({} chunks, {:.2}s)",
            args.output_path,
            summary.chunks,
            summary.elapsed.as_secs_f64()
        );
        info!("To try several voices and texts quickly, run `tts-server serve` and open http://{DEFAULT_HOST}:{DEFAULT_PORT}");
    }
    Ok(())
}
