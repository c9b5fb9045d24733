use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};

/// Per-dependency breaker thresholds as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_half_open_successes() -> u32 {
    3
}

impl BreakerSettings {
    pub fn new(failure_threshold: u32, recovery_timeout_seconds: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_seconds,
            half_open_successes: default_half_open_successes(),
        }
    }

    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
            half_open_successes: self.half_open_successes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breakers: BTreeMap<String, BreakerSettings>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breakers: BTreeMap::from([
                ("gemini".to_string(), BreakerSettings::new(5, 30)),
                ("ocr".to_string(), BreakerSettings::new(3, 60)),
                ("supabase".to_string(), BreakerSettings::new(10, 15)),
            ]),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, settings) in &self.circuit_breakers {
            if settings.failure_threshold == 0 {
                return Err(anyhow::anyhow!("熔断器 {name} 的失败阈值必须大于0"));
            }
            if settings.half_open_successes == 0 {
                return Err(anyhow::anyhow!("熔断器 {name} 的半开成功次数必须大于0"));
            }
        }
        Ok(())
    }

    pub fn build_registry(&self) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::from_configs(
            self.circuit_breakers
                .iter()
                .map(|(name, settings)| (name.clone(), settings.to_breaker_config())),
        )
    }
}
