//! Configuration management for hostbridge
//!
//! Every section is optional; missing keys fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::bridge::calibration::{CalibrationSettings, FlushMode};
use crate::gateway::PortStrategy;
use crate::host::SimLayout;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub banks: BanksConfig,
    #[serde(default)]
    pub sim: SimLayout,
}

/// External script to launch
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScriptConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Skip interpreter lookup and use this executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<PathBuf>,
    /// Extra arguments passed after the port
    #[serde(default)]
    pub args: Vec<String>,
}

/// RPC gateway binding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
    #[serde(default)]
    pub random_port: bool,
    /// How long a call into the script may take before it counts as failed
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_attempts: default_bind_attempts(),
            random_port: false,
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn strategy(&self) -> PortStrategy {
        if self.random_port {
            PortStrategy::Random
        } else {
            PortStrategy::Sequential { start: self.port }
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_threshold_ticks")]
    pub threshold_ticks: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold_ticks: default_threshold_ticks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_unmute_after_ticks")]
    pub unmute_after_ticks: u32,
    #[serde(default)]
    pub flush: FlushMode,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_ms: default_settle_ms(),
            unmute_after_ticks: default_unmute_after_ticks(),
            flush: FlushMode::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn settings(&self) -> CalibrationSettings {
        CalibrationSettings {
            enabled: self.enabled,
            settle: Duration::from_millis(self.settle_ms),
            unmute_after_ticks: self.unmute_after_ticks,
            flush: self.flush,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ProcessConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Upper bounds on the banks exposed to the script
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BanksConfig {
    #[serde(default = "default_max_tracks")]
    pub max_tracks: usize,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_max_parameters")]
    pub max_parameters: usize,
}

impl Default for BanksConfig {
    fn default() -> Self {
        Self {
            max_tracks: default_max_tracks(),
            max_devices: default_max_devices(),
            max_parameters: default_max_parameters(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BridgeConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_ms == 0 {
            anyhow::bail!("scheduler.tick_ms must be greater than 0");
        }

        if self.gateway.bind_attempts == 0 {
            anyhow::bail!("gateway.bind_attempts must be at least 1");
        }

        if !self.gateway.random_port && self.gateway.port == 0 {
            anyhow::bail!("gateway.port cannot be 0 (use random_port instead)");
        }

        if self.gateway.call_timeout_ms == 0 {
            anyhow::bail!("gateway.call_timeout_ms must be greater than 0");
        }

        if self.watchdog.threshold_ticks == 0 {
            anyhow::bail!("watchdog.threshold_ticks must be at least 1");
        }

        if self.calibration.settle_ms > 1000 {
            anyhow::bail!(
                "calibration.settle_ms is {} (must be at most 1000)",
                self.calibration.settle_ms
            );
        }

        let banks = &self.banks;
        if banks.max_tracks == 0 || banks.max_devices == 0 || banks.max_parameters == 0 {
            anyhow::bail!("bank sizes must be greater than 0");
        }

        if let Some(path) = &self.script.path {
            if path.as_os_str().is_empty() {
                anyhow::bail!("script.path cannot be empty");
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_port() -> u16 { 25333 }
fn default_bind_attempts() -> u32 { 10 }
fn default_call_timeout_ms() -> u64 { 2000 }
fn default_tick_ms() -> u64 { 16 }
fn default_threshold_ticks() -> u32 { 100 }
fn default_true() -> bool { true }
fn default_settle_ms() -> u64 { 25 }
fn default_unmute_after_ticks() -> u32 { 10 }
fn default_shutdown_grace_ms() -> u64 { 1000 }
fn default_max_tracks() -> usize { 64 }
fn default_max_devices() -> usize { 16 }
fn default_max_parameters() -> usize { 32 }
