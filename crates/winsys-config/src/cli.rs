//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments for tools built on the buffer manager.
///
/// CLI values override settings loaded from `winsys.ron`.
#[derive(Parser, Debug)]
#[command(name = "winsys-demo", about = "Simulated GPU buffer manager workload")]
pub struct CliArgs {
    /// Batch buffer size in bytes.
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Smallest slab size class in bytes.
    #[arg(long)]
    pub min_bucket: Option<u64>,

    /// Slab allocation retry budget.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Rendering contexts (threads) to simulate.
    #[arg(long, default_value_t = 2)]
    pub contexts: usize,

    /// Frames each context renders.
    #[arg(long, default_value_t = 32)]
    pub frames: u32,

    /// Simulated GPU memory in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub memory_limit: u64,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(size) = args.batch_size {
            self.batch.size = size;
        }
        if let Some(min) = args.min_bucket {
            self.slab.min_bucket_size = min;
        }
        if let Some(retries) = args.max_retries {
            self.slab.max_retries = retries;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
