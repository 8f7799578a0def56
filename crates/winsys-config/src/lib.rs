//! Configuration for the window-system buffer manager.
//!
//! Settings persist to disk as a RON file. Every section uses
//! `#[serde(default)]` so partial or older files still load, and a small set
//! of CLI overrides can be layered on top via clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    BatchConfig, Config, DebugConfig, FenceConfig, FreeSlabConfig, PresentConfig, SlabConfig,
};
pub use error::ConfigError;
