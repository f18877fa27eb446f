use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(name = "asdfs")]
#[command(version, about = "POSIX filesystem backed by a record-oriented key-value store")]
pub struct Cli {
    /// Path to the YAML configuration file
    pub config: PathBuf,

    /// Mount point; overrides mountDir from the configuration
    pub mountpoint: Option<PathBuf>,

    /// Mount options, comma separated
    #[arg(short = 'o', value_delimiter = ',', value_name = "rw|ro|debug")]
    pub options: Vec<MountOpt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MountOpt {
    Rw,
    Ro,
    Debug,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
