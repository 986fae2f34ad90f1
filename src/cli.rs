//! Command-line arguments.

use clap::Parser;

/// Guardian - CronJob monitoring operator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = TracingFormat::Auto)]
    pub log_format: TracingFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum TracingFormat {
    /// Human-readable formatter (default in debug builds)
    Pretty,
    /// JSON formatter (default in release builds)
    Json,
    /// Auto-select based on build mode
    Auto,
}

impl TracingFormat {
    pub fn use_pretty(self) -> bool {
        match self {
            TracingFormat::Pretty => true,
            TracingFormat::Json => false,
            TracingFormat::Auto => cfg!(debug_assertions),
        }
    }
}
