use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use native_llm::chat;
use native_llm::config::Settings;
use native_llm::llm::{NativeEngine, ScriptedEngine, Session};
use native_llm::logging;

/// Interactive chat over a native inference engine
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding default.toml and an optional local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Engine config file, overriding `engine.config_path`
    #[arg(long)]
    model_config: Option<String>,

    /// Use the built-in scripted engine instead of the native library
    #[arg(long)]
    scripted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load settings first
    let settings = Settings::from_dir(&cli.config_dir)
        .with_context(|| format!("failed to load settings from {}", cli.config_dir.display()))?;

    // Initialize the subscriber before any engine work
    let _guard = logging::init(&settings.logging);
    info!("native-llm starting up");

    let config_path = cli.model_config.clone().unwrap_or_else(|| settings.engine.config_path.clone());

    #[cfg(feature = "native")]
    {
        if !cli.scripted {
            let engine = Arc::new(native_llm::llm::NativeLibrary::new());
            return run(engine, &settings, &config_path).await;
        }
    }

    if !cli.scripted {
        info!("Built without the native library, using the scripted engine");
    }
    run(Arc::new(ScriptedEngine::new()), &settings, &config_path).await
}

async fn run<E: NativeEngine>(engine: Arc<E>, settings: &Settings, config_path: &str) -> Result<()> {
    let session = Session::create(engine, config_path)?;

    if let Some(extra) = &settings.engine.extra_config {
        session.configure(extra)?;
    }
    session.set_thinking(settings.engine.thinking)?;
    session.set_vision_size(settings.vision.image_width, settings.vision.image_height)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {wide_msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("Loading model from {}...", config_path));

    let loaded = tokio::task::block_in_place(|| session.load())?;
    if !loaded {
        pb.finish_with_message("Model load failed");
        bail!("native engine failed to load the model from {}", config_path);
    }
    if settings.engine.tune_on_load {
        pb.set_message("Tuning backend...");
        tokio::task::block_in_place(|| session.tune())?;
    }
    pb.finish_with_message("Model ready");

    let label = std::path::Path::new(config_path)
        .parent()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());

    chat::chat_loop(&session, &label).await?;

    session.dispose().await;
    info!("native-llm shut down");
    Ok(())
}
