//! Runtime configuration.

use crate::allocator::CachePolicy;
use std::fmt;
use std::str::FromStr;

/// How the variable store maps layer outputs onto allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Every output stays bound until its liveness dispose point.
    #[default]
    AlwaysPersist,
    /// Outputs that need no storage share one temporary slot.
    SingleSlotReuse,
    /// Separate ephemeral, ping-pong and persistent allocators.
    ThreeTier,
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationPolicy::AlwaysPersist => "always-persist",
            AllocationPolicy::SingleSlotReuse => "single-slot",
            AllocationPolicy::ThreeTier => "three-tier",
        };
        f.write_str(name)
    }
}

impl FromStr for AllocationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always-persist" | "persist" => Ok(AllocationPolicy::AlwaysPersist),
            "single-slot" | "reuse" => Ok(AllocationPolicy::SingleSlotReuse),
            "three-tier" | "tiered" => Ok(AllocationPolicy::ThreeTier),
            other => Err(format!(
                "unknown allocation policy '{other}' (expected always-persist, single-slot or three-tier)"
            )),
        }
    }
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub policy: AllocationPolicy,
    pub cache: CachePolicy,
    /// Keep cached buffers when a new run resets the allocators.
    pub keep_cache_between_runs: bool,
    /// Log every binding released during teardown.
    pub verbose_teardown: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            policy: AllocationPolicy::default(),
            cache: CachePolicy::default(),
            keep_cache_between_runs: true,
            verbose_teardown: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_keep_cache(mut self, keep: bool) -> Self {
        self.keep_cache_between_runs = keep;
        self
    }

    pub fn with_verbose_teardown(mut self, verbose: bool) -> Self {
        self.verbose_teardown = verbose;
        self
    }
}
