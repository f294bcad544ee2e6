use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Manifest(ManifestArgs),
    Sections(SectionsArgs),
}

#[derive(Debug, Args)]
pub struct ManifestArgs {
    /// Project root; every other path defaults relative to it.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Page-source tree (default: `<root>/src/app`).
    #[arg(long)]
    pub app_dir: Option<PathBuf>,

    /// Documentation-source tree (default: `<root>/docs`).
    #[arg(long)]
    pub docs_dir: Option<PathBuf>,

    /// Static-asset root (default: `<root>/public`).
    #[arg(long)]
    pub public_dir: Option<PathBuf>,

    /// Build output directory (default: `<root>/.next`).
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Output file path for the manifest (default: `<public>/offline-manifest.json`).
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Service-worker script, never listed as an asset (default: `<public>/sw.js`).
    #[arg(long)]
    pub service_worker: Option<PathBuf>,

    /// Output directory for per-document search index files (default: `<public>/search-index`).
    #[arg(long)]
    pub search_index_dir: Option<PathBuf>,

    /// Skip full-text metadata and search index files.
    #[arg(long)]
    pub no_full_text: bool,
}

#[derive(Debug, Args)]
pub struct SectionsArgs {
    /// Markdown file to split (front matter is stripped first).
    #[arg(long)]
    pub input: PathBuf,
}
