#![allow(dead_code)]

use connlab_core::error::Result;
use connlab_harness::scenarios;
use connlab_harness::{Harness, HarnessConfig, OperationReport};
use std::time::Duration;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .without_time()
        .try_init();
}

pub fn test_config() -> HarnessConfig {
    HarnessConfig::default()
        .with_admission_timeout(Duration::from_secs(5))
        .with_idle_sweep_interval(Duration::from_millis(20))
}

pub async fn harness() -> Harness {
    init_logging();
    Harness::new(test_config()).await.expect("start harness")
}

pub async fn run_scenario(name: &str) -> Result<Vec<OperationReport>> {
    init_logging();
    let scenario = scenarios::find(name).unwrap_or_else(|| panic!("unknown scenario {name}"));
    scenario.run(test_config()).await
}
