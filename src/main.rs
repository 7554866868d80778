use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;

use chayachitr::config::Config;
use chayachitr::model::{ImageId, OutputFormat, TransformParams, UserId};
use chayachitr::TransformationService;

/// Chayachitr - content-addressed image transformation cache
#[derive(Parser, Debug)]
#[command(name = "chayachitr")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(long)]
    test: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload an original image
    Upload {
        #[arg(long)]
        user: String,

        /// Image file (jpeg, png, gif or webp)
        file: PathBuf,

        /// Content type; guessed from the extension when omitted
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Transform an uploaded image, reusing a recorded result when present
    Transform {
        #[arg(long)]
        user: String,

        #[arg(long)]
        image: ImageId,

        /// Transformation parameters as JSON, or @path to read them from a file
        #[arg(long)]
        params: String,
    },

    /// Show one image and its transformations
    Show {
        #[arg(long)]
        user: String,

        #[arg(long)]
        image: ImageId,
    },

    /// List a user's images, newest first
    List {
        #[arg(long)]
        user: String,

        #[arg(long)]
        page: Option<u32>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Print the process metrics in Prometheus text format
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .and_then(|config| config.validate().map(|_| config))
        .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;

    if args.test {
        println!("configuration file {} is valid", args.config.display());
        return Ok(());
    }

    chayachitr::logging::init_subscriber(&config.logging)
        .context("Failed to initialize logging subsystem")?;

    tracing::info!(
        config_file = %args.config.display(),
        storage = ?config.storage.backend,
        ledger = ?config.ledger.backend,
        "Configuration loaded successfully"
    );

    let Some(command) = args.command else {
        bail!("no command given; run with --help for usage");
    };

    let service = TransformationService::from_config(&config)
        .await
        .context("Failed to initialize backends")?;

    match command {
        Command::Upload {
            user,
            file,
            content_type,
        } => {
            let content_type = match content_type {
                Some(ct) => ct,
                None => guess_content_type(&file)?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let view = service
                .upload(&UserId::new(user), &filename, &content_type, Bytes::from(data))
                .await?;
            print_json(&view)
        }
        Command::Transform {
            user,
            image,
            params,
        } => {
            let params = read_params(&params).await?;
            let outcome = service.transform(&UserId::new(user), &image, params).await?;
            print_json(&outcome)
        }
        Command::Show { user, image } => {
            let view = service.get_image(&UserId::new(user), &image).await?;
            print_json(&view)
        }
        Command::List { user, page, limit } => {
            let page = service.list_images(&UserId::new(user), page, limit).await?;
            print_json(&page)
        }
        Command::Metrics => {
            print!("{}", chayachitr::metrics::render());
            Ok(())
        }
    }
}

/// Parse inline JSON, or the contents of the file named after `@`
async fn read_params(arg: &str) -> anyhow::Result<TransformParams> {
    let json = match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read parameters from {}", path))?,
        None => arg.to_string(),
    };
    Ok(TransformParams::from_json(&json)?)
}

fn guess_content_type(file: &std::path::Path) -> anyhow::Result<String> {
    file.extension()
        .and_then(|ext| OutputFormat::from_extension(&ext.to_string_lossy()))
        .map(|format| format.content_type().to_string())
        .ok_or_else(|| anyhow!("cannot guess content type of {}; pass --content-type", file.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
