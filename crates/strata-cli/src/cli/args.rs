use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use strata_engine::Compression;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Layered, content-addressed bundles: resolve, materialize, export and publish"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a reference and print the resolved bundle
    Resolve(ResolveArgs),
    /// Write a bundle role into a directory
    Materialize(MaterializeArgs),
    /// Pack a directory into a deterministic tar archive
    Export(ExportArgs),
    /// Unpack and verify an exported archive
    Import(ImportArgs),
    /// List the files a working directory would contribute
    Scan(ScanArgs),
    /// Show layer assignment, storage decisions and digests
    Plan(PlanArgs),
    /// Publish a working directory to the registry
    Push(PushArgs),
    Version,
}

/// Flags shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Print machine-readable JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// name:version, sha256:<hex> or a path, with an optional #role suffix
    pub reference: String,

    /// Check that the role exists and show its layers
    #[arg(long)]
    pub role: Option<String>,

    /// Create the bundle cache directory
    #[arg(long)]
    pub prime_cache: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct MaterializeArgs {
    pub reference: String,

    /// Destination directory (created when missing)
    pub dest: PathBuf,

    /// Role to materialize; wins over a #role suffix
    #[arg(long)]
    pub role: Option<String>,

    /// Replace files whose content differs
    #[arg(long)]
    pub overwrite: bool,

    /// Download external data next to its pointer files
    #[arg(long)]
    pub prefetch_external: bool,

    /// Fetch straight into the destination, bypassing the blob cache
    #[arg(long)]
    pub no_cache: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Directory to export
    pub src: PathBuf,

    /// Archive path
    pub out: PathBuf,

    #[arg(long, default_value_t = Compression::None)]
    pub compression: Compression,

    /// Codec level (gzip 0-9, zstd 1-22)
    #[arg(long)]
    pub level: Option<i32>,

    /// Keep data files that have a pointer next to them
    #[arg(long)]
    pub include_external: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    pub archive: PathBuf,

    /// Destination directory; must be absent or empty
    pub dest: PathBuf,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Working directory containing strata.yaml
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Report what would be uploaded without touching any store
    #[arg(long)]
    pub dry_run: bool,

    /// Extra envelope annotation (KEY=VALUE), repeatable
    #[arg(long = "annotation", value_name = "KEY=VALUE")]
    pub annotations: Vec<String>,

    #[command(flatten)]
    pub output: OutputArgs,
}
