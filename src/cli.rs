use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "vice-exposer")]
#[command(about = "Runs and exposes interactive analyses inside the cluster")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short)]
    pub config: PathBuf,

    /// Port the HTTP API listens on
    #[arg(long, default_value_t = 60000)]
    pub port: u16,
}
