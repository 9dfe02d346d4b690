//! opaque-frame CLI
//!
//! Issues page tokens, renders proxied pages and fetches proxied images
//! from the command line, using the same configuration a host application
//! would.
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use opaque_frame::ProxyService;

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    /// (default: ~/.config/opaque-frame/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a token for an allowlisted page
    Issue {
        /// Absolute URL of the page to embed
        origin: String,

        /// Token lifetime in seconds (default: from config)
        #[arg(long)]
        ttl: Option<u64>,

        /// Extra claim as key=value; repeatable
        #[arg(long = "claim", value_name = "KEY=VALUE")]
        claims: Vec<String>,
    },

    /// Resolve a token and print the rewritten page
    Render {
        /// Token from `issue`
        token: String,
    },

    /// Stream the image behind a slug
    Image {
        /// 64-character image slug
        slug: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the slug for an image URL
    Slug {
        /// Absolute image URL
        url: String,
    },

    /// Print the HTML and image route patterns
    Routes,
}

/// Initialize tracing subscriber with configurable output format.
///
/// Set `OPAQUE_FRAME_LOG_FORMAT=json` for structured JSON logs.
/// Logs go to stderr so page and image output can be piped.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("OPAQUE_FRAME_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("opaque_frame=info,opaque_frame_cli=info"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = config::load(args.config.as_deref())?;
    let service = ProxyService::from_config(&config)?;
    tracing::debug!(map_root = %config.map.map_root.display(), "Loaded configuration");

    match args.command {
        Command::Issue {
            origin,
            ttl,
            claims,
        } => commands::issue(&service, &origin, ttl, &claims),
        Command::Render { token } => commands::render(&service, &token).await,
        Command::Image { slug, output } => {
            commands::image(&service, &slug, output.as_deref()).await
        }
        Command::Slug { url } => {
            commands::slug(&service, &url);
            Ok(())
        }
        Command::Routes => {
            commands::routes(&service);
            Ok(())
        }
    }
}
