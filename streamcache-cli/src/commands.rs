//! CLI command implementations

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Subcommand;
use streamcache_core::{CacheRegistry, CacheState, InfoHash, StreamCacheConfig, TorrentLayout};
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show the pieces a disk cache holds for one torrent
    Inspect {
        /// Root directory holding one piece directory per torrent
        #[arg(long)]
        save_path: PathBuf,
        /// Torrent info hash as 40 hex characters
        #[arg(long)]
        hash: String,
        /// Piece length in bytes
        #[arg(long)]
        piece_length: u64,
        /// Number of pieces in the torrent
        #[arg(long)]
        piece_count: u32,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Inspect {
            save_path,
            hash,
            piece_length,
            piece_count,
            json,
        } => inspect(save_path, &hash, piece_length, piece_count, json).await,
    }
}

/// Restore a disk cache and print its state
///
/// # Errors
/// - Invalid info hash or piece geometry
/// - Invalid `STREAMCACHE_*` environment overrides
/// - Missing cache directory
pub async fn inspect(
    save_path: PathBuf,
    hash: &str,
    piece_length: u64,
    piece_count: u32,
    json: bool,
) -> anyhow::Result<()> {
    let info_hash = InfoHash::from_hex(hash)?;
    if piece_length == 0 {
        bail!("Piece length must be greater than zero");
    }

    let directory = save_path.join(info_hash.to_hex());
    if !tokio::fs::try_exists(&directory)
        .await
        .with_context(|| format!("Failed to check {}", directory.display()))?
    {
        bail!("No cache directory for {} under {}", info_hash, save_path.display());
    }

    info!("Inspecting cache for {} in {}", info_hash, directory.display());

    let mut config = StreamCacheConfig::from_env()?.cache;
    config.use_disk = true;
    config.save_path = save_path;
    let registry = CacheRegistry::new(config);
    let layout = TorrentLayout::new(piece_length, piece_count);
    let state = tokio::task::spawn_blocking(move || {
        let cache = registry.open_cache(info_hash, layout);
        let state = cache.state();
        registry.close_cache(&info_hash);
        state
    })
    .await
    .context("Cache restore task failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_state(&state);
    }

    Ok(())
}

fn print_state(state: &CacheState) {
    println!("Torrent: {}", state.hash);
    println!(
        "  Pieces: {} of {} bytes",
        state.pieces_count, state.pieces_length
    );
    println!(
        "  Cached: {} pieces, {} complete, {} bytes",
        state.pieces.len(),
        state.completed_pieces(),
        state.filled
    );
    println!("  Capacity: {} bytes", state.capacity);

    if state.pieces.is_empty() {
        println!("  No pieces on disk");
        return;
    }

    println!();
    println!("     Piece          Size        Length  Status");
    for item in state.pieces.values() {
        let status = if item.completed { "complete" } else { "partial" };
        println!(
            "  {:>8}  {:>12}  {:>12}  {}",
            item.id, item.size, item.length, status
        );
    }
}
