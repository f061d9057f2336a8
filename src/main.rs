use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pixflow::domain::ImageRequest;
use pixflow::infrastructure::{
    CliArgs, Command, ComponentRegistry, HttpFetcher, ImageLoader, ImageResponse, PipelineConfig,
    StorageManager,
};

fn init_logging(config: &PipelineConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<PipelineConfig> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

async fn create_loader(config: &PipelineConfig) -> Result<ImageLoader> {
    let http = HttpFetcher::new(&config.user_agent, config.timeout())?;
    let registry = Arc::new(ComponentRegistry::with_defaults(http));

    let loader = ImageLoader::builder(registry.clone(), registry)
        .config(config.to_loader_config())
        .build()
        .await?;
    Ok(loader)
}

async fn save_png(response: &ImageResponse, output: PathBuf) -> Result<()> {
    let image = Arc::clone(&response.result.image);
    let path = output.clone();
    tokio::task::spawn_blocking(move || image.pixels().save_with_format(&path, image::ImageFormat::Png))
        .await?
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    info!(path = %output.display(), "Saved image");
    Ok(())
}

async fn load(
    loader: &ImageLoader,
    locator: String,
    dimensions: Option<(u32, u32)>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut builder = ImageRequest::builder(locator);
    if let Some((width, height)) = dimensions {
        builder = builder.dimensions(width, height);
    }

    let response = loader.execute(builder.build()).await?;
    let metadata = &response.result.metadata;
    println!(
        "{}x{} {} from {:?}",
        metadata.width,
        metadata.height,
        metadata.mime_type.as_deref().unwrap_or("unknown"),
        response.result.data_source,
    );

    if let Some(output) = output {
        save_png(&response, output).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = pixflow::VERSION, "Starting {}", pixflow::NAME);

    let loader = create_loader(&config).await?;

    let result = match args.command {
        Command::Load {
            locator,
            width,
            height,
            output,
        } => load(&loader, locator, width.zip(height), output).await,
        Command::Clear => {
            loader.clear_all().await;
            println!("Caches cleared");
            Ok(())
        }
    };

    loader.shutdown().await;

    result
}
