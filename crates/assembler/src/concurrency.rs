//! Concurrency planning
//!
//! Derives how many assembly runs may execute at once from the core count and
//! configuration. Each run drives one engine process at a time, and every
//! engine process is itself multi-threaded, so the pool stays small.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of assembly runs executing at once
    pub max_concurrent_runs: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Uses an explicit non-zero `max_concurrent_runs` unchanged
    /// - Otherwise 1 run below 8 cores, 2 below 16, 3 from 16 up
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .workers
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let max_concurrent_runs = if cfg.workers.max_concurrent_runs > 0 {
            cfg.workers.max_concurrent_runs
        } else {
            derive_max_runs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_runs,
        }
    }
}

fn derive_max_runs(cores: u32) -> u32 {
    match cores {
        0..=7 => 1,
        8..=15 => 2,
        _ => 3,
    }
}

pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkersConfig;
    use proptest::prelude::*;

    fn config_with(workers: WorkersConfig) -> Config {
        Config {
            workers,
            ..Config::default()
        }
    }

    // Run pool grows in steps with the core count.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_run_pool_derivation(cores in 1u32..256) {
            let plan = derive_plan(&config_with(WorkersConfig {
                logical_cores: Some(cores),
                max_concurrent_runs: 0,
            }));

            prop_assert_eq!(plan.total_cores, cores);
            let expected = if cores < 8 { 1 } else if cores < 16 { 2 } else { 3 };
            prop_assert_eq!(
                plan.max_concurrent_runs, expected,
                "For {} cores, expected {} runs but got {}",
                cores, expected, plan.max_concurrent_runs
            );
        }

        #[test]
        fn prop_explicit_run_limit_is_kept(cores in 1u32..256, explicit in 1u32..32) {
            let plan = derive_plan(&config_with(WorkersConfig {
                logical_cores: Some(cores),
                max_concurrent_runs: explicit,
            }));
            prop_assert_eq!(plan.max_concurrent_runs, explicit);
        }
    }

    #[test]
    fn test_autodetects_cores() {
        let plan = derive_plan(&Config::default());
        assert!(plan.total_cores >= 1);
        assert!((1..=3).contains(&plan.max_concurrent_runs));
    }
}
