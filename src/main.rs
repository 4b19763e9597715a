//! Binary entry point for repostscan.
//!
//! Operator CLI over the repost detector: hash images, register posts,
//! run checks and manage the on-disk index.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repostscan::config::RepostConfig;
use repostscan::hashing::bits_set;
use repostscan::models::MemeTemplate;
use repostscan::observability::{self, InitOptions};
use repostscan::services::FsImageFetcher;
use repostscan::storage::SqliteHashStore;
use repostscan::{ImageHash, PerceptualHasher, Post, PostId, PostType, RepostCheckService};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// repostscan - near-duplicate image repost detection.
#[derive(Parser)]
#[command(name = "repostscan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "REPOSTSCAN_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Compute the dhash of an image file.
    Hash {
        /// Image file to hash.
        image: PathBuf,
    },

    /// Register a post in the hash store.
    Ingest {
        /// External post id.
        post_id: String,

        /// Author name.
        #[arg(short, long)]
        author: String,

        /// Creation time, Unix seconds (default: now).
        #[arg(long)]
        created_at: Option<i64>,

        /// Image file to hash and store with the post.
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Subreddit the post was made in.
        #[arg(short, long, default_value = "")]
        subreddit: String,

        /// Submitted URL (defaults to the image path).
        #[arg(short, long)]
        url: Option<String>,

        /// Post type: image, link, text, video, gallery.
        #[arg(long, default_value = "image")]
        post_type: String,

        /// Parent post id when the post is a crosspost.
        #[arg(long)]
        crosspost_parent: Option<String>,
    },

    /// Register a meme template.
    Template {
        /// Template name.
        name: String,

        /// Image file of the blank template.
        image: PathBuf,

        /// Hamming distance within which a hash counts as this template.
        #[arg(short, long, default_value = "10")]
        tolerance: u32,

        /// Hamming cutoff applied to matches of this template.
        #[arg(short, long)]
        match_cutoff: Option<u32>,
    },

    /// Check a stored post for reposts.
    Check {
        /// External post id.
        post_id: String,
    },

    /// Rebuild the index.
    Rebuild {
        /// Rebuild even when the current index is fresh.
        #[arg(short, long)]
        force: bool,
    },

    /// Show index status.
    Status,
}

/// Main entry point.
fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match RepostConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = match observability::init_from_config(
        &config.observability,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: config.observability.metrics_enabled,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(command: Commands, config: &RepostConfig) -> Result<()> {
    match command {
        Commands::Hash { image } => cmd_hash(config, &image),
        Commands::Ingest {
            post_id,
            author,
            created_at,
            image,
            subreddit,
            url,
            post_type,
            crosspost_parent,
        } => {
            let mut post = Post::new(
                0,
                PostId::new(post_id),
                author,
                created_at.unwrap_or_else(repostscan::current_timestamp),
            )
            .with_subreddit(subreddit)
            .with_post_type(PostType::parse(&post_type));
            if let Some(url) = url.or_else(|| image.as_ref().map(|p| p.display().to_string())) {
                post = post.with_url(url);
            }
            if let Some(parent) = crosspost_parent {
                post = post.with_crosspost_parent(parent);
            }
            cmd_ingest(config, post, image.as_deref())
        },
        Commands::Template {
            name,
            image,
            tolerance,
            match_cutoff,
        } => cmd_template(config, name, &image, tolerance, match_cutoff),
        Commands::Check { post_id } => cmd_check(config, &PostId::new(post_id)),
        Commands::Rebuild { force } => cmd_rebuild(config, force),
        Commands::Status => cmd_status(config),
    }
}

fn hash_file(config: &RepostConfig, path: &Path) -> Result<ImageHash> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(PerceptualHasher::new(config.hash_size).hash_bytes(&bytes)?)
}

fn cmd_hash(config: &RepostConfig, image: &Path) -> Result<()> {
    let hash = hash_file(config, image)?;
    let hex = hash.to_hex();
    println!("{hex}");
    println!("bits set: {}", bits_set(&hex)?);
    Ok(())
}

fn cmd_ingest(config: &RepostConfig, post: Post, image: Option<&Path>) -> Result<()> {
    let post = match image {
        Some(path) => {
            let hash = hash_file(config, path)?;
            post.with_hash(hash)
        },
        None => post,
    };
    let store = SqliteHashStore::new(config.database_path())?;
    let row_id = store.insert_post(&post)?;
    println!("stored {} as row {row_id}", post.post_id);
    Ok(())
}

fn cmd_template(
    config: &RepostConfig,
    name: String,
    image: &Path,
    tolerance: u32,
    match_cutoff: Option<u32>,
) -> Result<()> {
    let hash = hash_file(config, image)?;
    let mut template = MemeTemplate::new(name, hash, tolerance);
    if let Some(cutoff) = match_cutoff {
        template = template.with_match_cutoff(cutoff);
    }
    SqliteHashStore::new(config.database_path())?.add_meme_template(&template)?;
    println!("stored template {}", template.name);
    Ok(())
}

fn check_service(config: &RepostConfig) -> Result<RepostCheckService> {
    Ok(RepostCheckService::from_config(config)?.with_fetcher(Arc::new(FsImageFetcher::new())))
}

fn cmd_check(config: &RepostConfig, post_id: &PostId) -> Result<()> {
    let result = check_service(config)?.check_post_id(post_id)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_rebuild(config: &RepostConfig, force: bool) -> Result<()> {
    let service = check_service(config)?;
    let manager = service.index_manager();
    let generation = if force {
        manager.force_rebuild()?
    } else {
        manager.ensure_fresh()?.generation().clone()
    };
    println!("{}", serde_json::to_string_pretty(&generation)?);
    Ok(())
}

fn cmd_status(config: &RepostConfig) -> Result<()> {
    let service = check_service(config)?;
    let status = service.index_manager().status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
