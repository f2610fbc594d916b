use clap::Parser;

/// Common CLI surface for all four binaries: `-c <config>` required, `-D`
/// debug, `-d` dummy/no-hardware, `-p <port>` override.
#[derive(Debug, Parser)]
#[command(name = "cooler-webui", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: String,

    /// Enable debug-level logging regardless of `RUST_LOG`.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Unused by the webui (it has no hardware of its own) but accepted for
    /// CLI-surface parity with the other three binaries.
    #[arg(short = 'd', long = "dummy")]
    pub dummy: bool,

    /// Override the web server port from the config file.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}
