//! Timeout and restart tables of the config file

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-step timeouts in seconds; unset entries use the defaults below
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_check: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_install: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recompute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<u64>,
}

impl TimeoutConfig {
    pub fn is_empty(&self) -> bool {
        *self == TimeoutConfig::default()
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<u64>> {
        Some(match name {
            "version-check" => &mut self.version_check,
            "probe" => &mut self.probe,
            "install" => &mut self.install,
            "native-install" => &mut self.native_install,
            "ready" => &mut self.ready,
            "ingest" => &mut self.ingest,
            "recompute" => &mut self.recompute,
            "export" => &mut self.export,
            "ping" => &mut self.ping,
            _ => return None,
        })
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        match name {
            "version-check" => self.version_check,
            "probe" => self.probe,
            "install" => self.install,
            "native-install" => self.native_install,
            "ready" => self.ready,
            "ingest" => self.ingest,
            "recompute" => self.recompute,
            "export" => self.export,
            "ping" => self.ping,
            _ => None,
        }
    }

    /// Returns false when `name` is not a timeout key
    pub fn set(&mut self, name: &str, secs: u64) -> bool {
        match self.slot(name) {
            Some(slot) => {
                *slot = Some(secs);
                true
            }
            None => false,
        }
    }

    pub fn version_check(&self) -> Duration {
        secs(self.version_check, 10)
    }

    pub fn probe(&self) -> Duration {
        secs(self.probe, 30)
    }

    pub fn install(&self) -> Duration {
        secs(self.install, 300)
    }

    pub fn native_install(&self) -> Duration {
        secs(self.native_install, 600)
    }

    pub fn ready(&self) -> Duration {
        secs(self.ready, 60)
    }

    pub fn ingest(&self) -> Duration {
        secs(self.ingest, 120)
    }

    pub fn recompute(&self) -> Duration {
        secs(self.recompute, 120)
    }

    pub fn export(&self) -> Duration {
        secs(self.export, 60)
    }

    pub fn ping(&self) -> Duration {
        secs(self.ping, 10)
    }
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

/// Respawn policy for a worker that exits unexpectedly
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RestartConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
}

impl RestartConfig {
    pub fn is_empty(&self) -> bool {
        *self == RestartConfig::default()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        match name {
            "max-restarts" => self.max_restarts,
            "backoff-ms" => self.backoff_ms,
            "backoff-max-ms" => self.backoff_max_ms,
            _ => None,
        }
    }

    pub fn set(&mut self, name: &str, value: u64) -> bool {
        match name {
            "max-restarts" => self.max_restarts = Some(value),
            "backoff-ms" => self.backoff_ms = Some(value),
            "backoff-max-ms" => self.backoff_max_ms = Some(value),
            _ => return false,
        }
        true
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts.map_or(3, |n| n.min(u64::from(u32::MAX)) as u32)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms.unwrap_or(500)
    }

    pub fn backoff_max_ms(&self) -> u64 {
        self.backoff_max_ms.unwrap_or(8_000)
    }
}
