use clap::Parser;

/// Common CLI surface for all four binaries: `-c <config>` required, `-D`
/// debug, `-d` dummy/no-hardware, `-p <port>` override.
#[derive(Debug, Parser)]
#[command(name = "cooler-controller", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: String,

    /// Enable debug-level logging regardless of `RUST_LOG`.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Dummy mode: no real hardware/network side effects where avoidable.
    #[arg(short = 'd', long = "dummy")]
    pub dummy: bool,

    /// Override the healthz port from the config file.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}
