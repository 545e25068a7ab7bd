use std::time::Duration;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SystemConfig {
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
    pub lookup: LookupConfig,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoutingConfig {
    // Also called k in the original paper
    pub bucket_size: usize,

    // How often a bucket with no traffic gets probed with a random lookup
    pub refresh_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            refresh_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LookupConfig {
    // Also called alpha in the original paper
    // n. of nodes queried in parallel per lookup
    pub concurrency: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self { concurrency: 3 }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StorageConfig {
    // TTL granted to stored values whose publisher did not pick one
    pub default_lifetime: Duration,

    // All holders push their entries to the current k closest on this cadence
    pub replicate_interval: Duration,

    // Publishers refresh their authoritative entries on this slower cadence
    pub republish_interval: Duration,

    // Maximum number of stored (key, subkey) entries
    pub max_entries: usize,

    // Maximum stored value size (in bytes)
    pub max_value_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(24 * 60 * 60 + 10),
            replicate_interval: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(24 * 60 * 60),
            max_entries: 1024,
            max_value_size: 128 * 1024, // 128 KiB
        }
    }
}
