use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "spec-harvest",
    version,
    about = "Need-set scoring, indexing packets and runtime event replay for product spec harvesting"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Needset(NeedsetArgs),
    Pack(PackArgs),
    ReplayEvents(ReplayEventsArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NeedsetArgs {
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub previous: Option<PathBuf>,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value = ".cache/spec-harvest")]
    pub out_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct PackArgs {
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub needset: Option<PathBuf>,

    #[arg(long, default_value = ".cache/spec-harvest/packets")]
    pub out_dir: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub schema_root: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ValidationMode::Warn)]
    pub validation: ValidationMode,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ValidationMode {
    Off,
    Warn,
    Strict,
}

#[derive(Args, Debug, Clone)]
pub struct ReplayEventsArgs {
    #[arg(long)]
    pub events: PathBuf,

    #[arg(long, default_value = ".cache/spec-harvest")]
    pub out_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub run_id: String,

    #[arg(long, default_value = ".cache/spec-harvest")]
    pub out_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
