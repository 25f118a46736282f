//! Piece catalog commands.
//!
//! - `flowline pieces list` - list installed piece versions
//! - `flowline pieces add` - install a `.wasm` module
//! - `flowline pieces remove` - uninstall one or all versions
//! - `flowline pieces info` - ask a piece for its metadata

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde_json::json;

use flowline_engine::PieceRef;

use super::Context;

/// Piece catalog commands.
#[derive(Args, Debug)]
pub struct PiecesArgs {
    #[command(subcommand)]
    pub command: PiecesCommand,
}

#[derive(Subcommand, Debug)]
pub enum PiecesCommand {
    /// List installed pieces
    List,

    /// Install a compiled piece module
    Add(AddArgs),

    /// Remove a piece (all versions unless --version is given)
    Remove(RemoveArgs),

    /// Print the metadata a piece reports about itself
    Info(InfoArgs),
}

/// Arguments for `flowline pieces add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Piece name
    pub name: String,

    /// Piece version
    pub version: String,

    /// Path to the `.wasm` module
    pub module: PathBuf,

    /// Description shown by `pieces list`
    #[arg(long, short, default_value = "")]
    pub description: String,
}

/// Arguments for `flowline pieces remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub name: String,

    #[arg(long)]
    pub version: Option<String>,
}

/// Arguments for `flowline pieces info`.
#[derive(Args, Debug)]
pub struct InfoArgs {
    pub name: String,
    pub version: String,
}

pub async fn run(args: PiecesArgs, ctx: &Context) -> Result<()> {
    match args.command {
        PiecesCommand::List => run_list(ctx),
        PiecesCommand::Add(add_args) => run_add(add_args, ctx),
        PiecesCommand::Remove(remove_args) => run_remove(remove_args, ctx),
        PiecesCommand::Info(info_args) => run_info(info_args, ctx).await,
    }
}

fn run_list(ctx: &Context) -> Result<()> {
    let catalog = ctx.catalog()?;
    let pieces = catalog.list();

    if ctx.json_output {
        let rows: Vec<_> = pieces
            .iter()
            .map(|(piece, entry)| {
                json!({
                    "name": piece.name,
                    "version": piece.version,
                    "description": entry.description,
                    "sha256": entry.sha256,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if pieces.is_empty() {
        println!("No pieces installed in {}", catalog.root().display());
        return Ok(());
    }
    for (piece, entry) in pieces {
        println!("{:<32} {}", piece.to_string(), entry.description);
    }
    Ok(())
}

fn run_add(args: AddArgs, ctx: &Context) -> Result<()> {
    let piece = PieceRef::new(&args.name, &args.version);
    let mut catalog = ctx.catalog()?;
    catalog
        .install(&piece, &args.module, &args.description)
        .with_context(|| format!("Failed to install {}", args.module.display()))?;

    println!("Installed {}", piece);
    if ctx.verbose
        && let Some(entry) = catalog.get(&piece)
    {
        println!("  Path:   {}", catalog.root().join(&entry.path).display());
        if let Some(digest) = &entry.sha256 {
            println!("  SHA256: {}", digest);
        }
    }
    Ok(())
}

fn run_remove(args: RemoveArgs, ctx: &Context) -> Result<()> {
    let mut catalog = ctx.catalog()?;
    let removed = catalog.remove(&args.name, args.version.as_deref())?;
    if removed == 0 {
        anyhow::bail!("no installed piece matches '{}'", args.name);
    }
    println!("Removed {} version(s) of {}", removed, args.name);
    Ok(())
}

async fn run_info(args: InfoArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.engine()?;
    let metadata = engine
        .extract_piece_metadata(PieceRef::new(&args.name, &args.version))
        .await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
