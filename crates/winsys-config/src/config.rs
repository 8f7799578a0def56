//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE_NAME: &str = "winsys.ron";

/// Top-level buffer manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Slab sub-allocator settings.
    pub slab: SlabConfig,
    /// Cache of released slab kernel buffers.
    pub free_slabs: FreeSlabConfig,
    /// Per-context command batch settings.
    pub batch: BatchConfig,
    /// Fence manager settings.
    pub fence: FenceConfig,
    /// Front-buffer presentation settings.
    pub present: PresentConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Slab pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlabConfig {
    /// Smallest size class in bytes. Must be a power of two.
    pub min_bucket_size: u64,
    /// Number of power-of-two size classes starting at `min_bucket_size`.
    pub num_buckets: u32,
    /// Sub-buffers a slab should hold, before clamping to `max_slab_size`.
    pub desired_buffers_per_slab: u32,
    /// Upper bound on the kernel allocation backing one slab.
    pub max_slab_size: u64,
    /// Attempts to find or create a slab before an allocation fails.
    pub max_retries: u32,
    /// Fully free slabs kept per size class before they are released.
    pub max_free_slabs: usize,
    /// Kernel allocations are rounded up to this many bytes.
    pub page_alignment: u64,
}

/// Configuration of the cache holding kernel buffers of released slabs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FreeSlabConfig {
    /// Minimum time between two scans for expired entries.
    pub check_interval_ms: u64,
    /// How long an unused kernel buffer stays cached before release.
    pub timeout_ms: u64,
}

/// Batch buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Capacity of one batch in bytes.
    pub size: u32,
    /// Bytes kept free at the end for the flush/end-of-batch trailer.
    pub reserved: u32,
    /// Relocation entries one batch can carry.
    pub max_relocs: u32,
    /// Fence class used for every submission.
    pub fence_class: u32,
}

/// Fence manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FenceConfig {
    /// Number of ordered fence classes.
    pub num_classes: u32,
    /// Unsignaled fences one class may hold before creation applies back-pressure.
    pub max_outstanding: usize,
    /// Sleep after a back-pressure finish, in microseconds.
    pub pressure_sleep_us: u64,
}

/// Front-buffer presentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresentConfig {
    /// Presents allowed in flight before `flush_frontbuffer` waits.
    pub max_frames_in_flight: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log the full validation list and relocations on every flush.
    pub dump_validation: bool,
}

// --- Default implementations ---

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            min_bucket_size: 64,
            num_buckets: 8,
            desired_buffers_per_slab: 32,
            max_slab_size: 1024 * 1024,
            max_retries: 100,
            max_free_slabs: 1,
            page_alignment: 4096,
        }
    }
}

impl Default for FreeSlabConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10,
            timeout_ms: 1000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 16 * 1024,
            reserved: 16,
            max_relocs: 400,
            fence_class: 0,
        }
    }
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            num_classes: 1,
            max_outstanding: 4096,
            pressure_sleep_us: 100,
        }
    }
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 1,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dump_validation: false,
        }
    }
}

impl SlabConfig {
    /// Byte size of every size class, smallest first.
    pub fn bucket_sizes(&self) -> Vec<u64> {
        (0..self.num_buckets)
            .map(|i| self.min_bucket_size << i)
            .collect()
    }
}

impl FreeSlabConfig {
    /// Scan interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Cache timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FenceConfig {
    /// Back-pressure sleep as a [`Duration`].
    pub fn pressure_sleep(&self) -> Duration {
        Duration::from_micros(self.pressure_sleep_us)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `winsys.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the buffer manager cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let slab = &self.slab;
        if slab.min_bucket_size == 0 || !slab.min_bucket_size.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "slab.min_bucket_size",
                reason: format!("{} is not a non-zero power of two", slab.min_bucket_size),
            });
        }
        if slab.num_buckets == 0 || slab.min_bucket_size.leading_zeros() < slab.num_buckets {
            return Err(ConfigError::Invalid {
                field: "slab.num_buckets",
                reason: format!("{} buckets do not fit in 64 bits", slab.num_buckets),
            });
        }
        if slab.page_alignment == 0 || !slab.page_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "slab.page_alignment",
                reason: format!("{} is not a non-zero power of two", slab.page_alignment),
            });
        }
        // flush + end-of-batch + padding noop
        if self.batch.reserved < 12 {
            return Err(ConfigError::Invalid {
                field: "batch.reserved",
                reason: format!("{} bytes cannot hold the batch trailer", self.batch.reserved),
            });
        }
        if self.batch.reserved >= self.batch.size || self.batch.size % 8 != 0 {
            return Err(ConfigError::Invalid {
                field: "batch.size",
                reason: format!(
                    "{} must be a multiple of 8 larger than the reserve",
                    self.batch.size
                ),
            });
        }
        if self.batch.fence_class >= self.fence.num_classes {
            return Err(ConfigError::Invalid {
                field: "batch.fence_class",
                reason: format!(
                    "class {} but only {} classes configured",
                    self.batch.fence_class, self.fence.num_classes
                ),
            });
        }
        Ok(())
    }
}
