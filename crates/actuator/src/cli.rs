use clap::Parser;

/// Common CLI surface for all four binaries: `-c <config>` required, `-D`
/// debug, `-d` dummy/no-hardware, `-p <port>` override.
#[derive(Debug, Parser)]
#[command(name = "cooler-actuator", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: String,

    /// Enable debug-level logging regardless of `RUST_LOG`.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Dummy mode: mock valve driver + simulated flow source, regardless of
    /// `hardware` config.
    #[arg(short = 'd', long = "dummy")]
    pub dummy: bool,

    /// Unused by the actuator (no REST surface of its own) but accepted for
    /// CLI-surface parity with the other three binaries.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}
