use std::sync::Mutex;

use sysinfo::System;

use super::ClaimCheckError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }
}

pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Host memory as reported by the operating system.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemorySample {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();
        MemorySample {
            available_bytes: system.available_memory(),
            total_bytes: system.total_memory(),
        }
    }
}

/// When the host counts as short on memory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemoryRule {
    /// Pressure once used memory exceeds this fraction of the total.
    UsedAbove(f64),
    /// Pressure once available memory drops below this fraction of the total.
    FreeBelow(f64),
    Disabled,
}

impl MemoryRule {
    pub fn from_config(rule: &str, fraction: f64) -> Result<Self, ClaimCheckError> {
        let rule = rule.trim().to_ascii_lowercase();
        if rule == "disabled" {
            return Ok(Self::Disabled);
        }
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ClaimCheckError::InvalidMemoryFraction { fraction });
        }
        match rule.as_str() {
            "used_above" => Ok(Self::UsedAbove(fraction)),
            "free_below" => Ok(Self::FreeBelow(fraction)),
            _ => Err(ClaimCheckError::InvalidMemoryRule { rule }),
        }
    }

    pub fn is_under_pressure(&self, sample: &MemorySample) -> bool {
        if sample.total_bytes == 0 {
            return false;
        }
        match *self {
            Self::UsedAbove(fraction) => {
                sample.used_bytes() as f64 > fraction * sample.total_bytes as f64
            }
            Self::FreeBelow(fraction) => {
                (sample.available_bytes as f64) < fraction * sample.total_bytes as f64
            }
            Self::Disabled => false,
        }
    }

    pub fn describe(&self, total_bytes: u64) -> String {
        match *self {
            Self::UsedAbove(fraction) => format!(
                "used > {:.0}% ({} bytes)",
                fraction * 100.0,
                (fraction * total_bytes as f64) as u64
            ),
            Self::FreeBelow(fraction) => format!(
                "free < {:.0}% ({} bytes)",
                fraction * 100.0,
                (fraction * total_bytes as f64) as u64
            ),
            Self::Disabled => "disabled".to_owned(),
        }
    }
}

impl Default for MemoryRule {
    fn default() -> Self {
        Self::UsedAbove(0.85)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryRule, MemorySample};
    use crate::claimcheck::ClaimCheckError;

    const GIB: u64 = 1 << 30;

    fn sample(available: u64) -> MemorySample {
        MemorySample {
            available_bytes: available * GIB,
            total_bytes: 10 * GIB,
        }
    }

    #[test]
    fn used_above_triggers_only_when_nearly_exhausted() {
        let rule = MemoryRule::UsedAbove(0.85);
        assert!(!rule.is_under_pressure(&sample(5)));
        assert!(rule.is_under_pressure(&sample(1)));
    }

    #[test]
    fn free_below_compares_available_memory() {
        let rule = MemoryRule::FreeBelow(0.2);
        assert!(!rule.is_under_pressure(&sample(3)));
        assert!(rule.is_under_pressure(&sample(1)));
    }

    #[test]
    fn disabled_and_unknown_totals_never_trigger() {
        assert!(!MemoryRule::Disabled.is_under_pressure(&sample(0)));
        assert!(!MemoryRule::UsedAbove(0.1).is_under_pressure(&MemorySample::default()));
    }

    #[test]
    fn parses_config_values() {
        assert_eq!(
            MemoryRule::from_config("USED_ABOVE", 0.9).expect("rule should parse"),
            MemoryRule::UsedAbove(0.9)
        );
        assert_eq!(
            MemoryRule::from_config("disabled", 7.0).expect("fraction ignored"),
            MemoryRule::Disabled
        );
        assert!(matches!(
            MemoryRule::from_config("free_below", 1.5),
            Err(ClaimCheckError::InvalidMemoryFraction { .. })
        ));
        assert!(matches!(
            MemoryRule::from_config("sometimes", 0.5),
            Err(ClaimCheckError::InvalidMemoryRule { .. })
        ));
    }
}
