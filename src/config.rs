//! Immutable, once-captured environment configuration (§6, §9 "Global
//! tunables... capture into a SchedulerConfig struct at call entry").

use std::env;
use std::path::PathBuf;

fn env_bool(key: &str) -> bool {
    env::var(key).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

fn env_int(key: &str) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key).ok().map(PathBuf::from)
}

/// Snapshot of the recognized environment variables (§6), read exactly once
/// per scheduling call so a concurrent mutation of the process environment
/// can never change behavior mid-call.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub multioutput: bool,
    pub fuse_as_one_kernel: bool,
    pub fuse_conv_bw: bool,
    pub save_schedule: i64,
    pub no_memory_planner: bool,
    pub use_copy_kernel: bool,
    pub graph: i64,
    pub debug: i64,
    pub logops: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        SchedulerConfig {
            multioutput: env_bool("MULTIOUTPUT"),
            fuse_as_one_kernel: env_bool("FUSE_AS_ONE_KERNEL"),
            fuse_conv_bw: env_bool("FUSE_CONV_BW"),
            save_schedule: env_int("SAVE_SCHEDULE"),
            no_memory_planner: env_bool("NO_MEMORY_PLANNER"),
            use_copy_kernel: env_bool("USE_COPY_KERNEL"),
            graph: env_int("GRAPH"),
            debug: env_int("DEBUG"),
            logops: env_path("LOGOPS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_off() {
        let c = SchedulerConfig::default();
        assert!(!c.multioutput);
        assert!(!c.no_memory_planner);
        assert_eq!(c.save_schedule, 0);
        assert!(c.logops.is_none());
    }
}
