//! Logger configuration management

use anyhow::{Context, Result, anyhow};
use capture::{FlushPolicy, PipelineConfig, ReassemblyConfig};
use common::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub logger: LoggerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub clock: ClockSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerSettings {
    #[serde(default = "LoggerSettings::default_log_level")]
    pub log_level: String,
    /// Run without the stdin command surface
    #[serde(default)]
    pub service_mode: bool,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            service_mode: false,
        }
    }
}

impl LoggerSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns, empty = any device
    #[serde(default)]
    pub filters: Vec<String>,
    /// Read from this interface number instead of auto-selecting
    #[serde(default)]
    pub interface: Option<u8>,
    #[serde(default = "UsbSettings::default_transfer_size")]
    pub transfer_size: usize,
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "UsbSettings::default_report_interval")]
    pub report_interval_secs: u64,
    #[serde(default = "UsbSettings::default_detach_kernel_driver")]
    pub detach_kernel_driver: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            interface: None,
            transfer_size: Self::default_transfer_size(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
            report_interval_secs: Self::default_report_interval(),
            detach_kernel_driver: Self::default_detach_kernel_driver(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_size() -> usize {
        512
    }

    fn default_transfer_timeout() -> u64 {
        10
    }

    fn default_report_interval() -> u64 {
        10
    }

    fn default_detach_kernel_driver() -> bool {
        true
    }

    /// Parsed filters; call after [`LoggerConfig::validate`]
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.filters
            .iter()
            .map(|f| f.parse::<DeviceFilter>().map_err(|e| anyhow!(e)))
            .collect()
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "PipelineSettings::default_ingest_capacity")]
    pub ingest_capacity: usize,
    #[serde(default = "PipelineSettings::default_ingest_high_water")]
    pub ingest_high_water: usize,
    #[serde(default = "PipelineSettings::default_line_ceiling")]
    pub line_ceiling: usize,
    #[serde(default = "PipelineSettings::default_lines_per_cycle")]
    pub lines_per_cycle: usize,
    #[serde(default = "PipelineSettings::default_reassembly_period")]
    pub reassembly_period_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ingest_capacity: Self::default_ingest_capacity(),
            ingest_high_water: Self::default_ingest_high_water(),
            line_ceiling: Self::default_line_ceiling(),
            lines_per_cycle: Self::default_lines_per_cycle(),
            reassembly_period_ms: Self::default_reassembly_period(),
        }
    }
}

impl PipelineSettings {
    fn default_ingest_capacity() -> usize {
        16 * 1024
    }

    fn default_ingest_high_water() -> usize {
        12 * 1024
    }

    fn default_line_ceiling() -> usize {
        1014
    }

    fn default_lines_per_cycle() -> usize {
        10
    }

    fn default_reassembly_period() -> u64 {
        5
    }

    pub fn reassembly_period(&self) -> Duration {
        Duration::from_millis(self.reassembly_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "StorageSettings::default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "StorageSettings::default_batch_high_water")]
    pub batch_high_water: usize,
    #[serde(default = "StorageSettings::default_max_dwell")]
    pub max_dwell_ms: u64,
    #[serde(default = "StorageSettings::default_batch_cap")]
    pub batch_cap: usize,
    #[serde(default = "StorageSettings::default_persist_period")]
    pub persist_period_ms: u64,
    #[serde(default = "StorageSettings::default_sync_on_flush")]
    pub sync_on_flush: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            log_dir: Self::default_log_dir(),
            batch_high_water: Self::default_batch_high_water(),
            max_dwell_ms: Self::default_max_dwell(),
            batch_cap: Self::default_batch_cap(),
            persist_period_ms: Self::default_persist_period(),
            sync_on_flush: Self::default_sync_on_flush(),
        }
    }
}

impl StorageSettings {
    fn default_log_dir() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usb-line-logger").join("logs")
        } else {
            PathBuf::from("/var/log/usb-line-logger")
        }
    }

    fn default_batch_high_water() -> usize {
        4096
    }

    fn default_max_dwell() -> u64 {
        2000
    }

    fn default_batch_cap() -> usize {
        64 * 1024
    }

    fn default_persist_period() -> u64 {
        100
    }

    fn default_sync_on_flush() -> bool {
        true
    }

    pub fn persist_period(&self) -> Duration {
        Duration::from_millis(self.persist_period_ms)
    }

    /// `log_dir` with `~` expanded
    pub fn expanded_log_dir(&self) -> PathBuf {
        let raw = self.log_dir.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSourceKind {
    /// Linux RTC character device
    #[default]
    Rtc,
    /// Host system clock plus an offset
    System,
    /// No wall clock; lines are stamped with the unavailable marker
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSettings {
    #[serde(default)]
    pub source: ClockSourceKind,
    #[serde(default = "ClockSettings::default_rtc_device")]
    pub rtc_device: PathBuf,
    #[serde(default = "ClockSettings::default_resync")]
    pub resync_secs: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            source: ClockSourceKind::default(),
            rtc_device: Self::default_rtc_device(),
            resync_secs: Self::default_resync(),
        }
    }
}

impl ClockSettings {
    fn default_rtc_device() -> PathBuf {
        PathBuf::from("/dev/rtc0")
    }

    fn default_resync() -> u64 {
        600 // 10 minutes
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

impl LoggerConfig {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-line-logger/logger.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: LoggerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-line-logger").join("logger.toml")
        } else {
            PathBuf::from(".config/usb-line-logger/logger.toml")
        }
    }

    /// Buffer sizing for [`capture::Pipeline::build`]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            ingest_capacity: self.pipeline.ingest_capacity,
            reassembly: ReassemblyConfig {
                line_ceiling: self.pipeline.line_ceiling,
                lines_per_cycle: self.pipeline.lines_per_cycle,
                high_water: self.pipeline.ingest_high_water,
            },
            flush: FlushPolicy {
                high_water: self.storage.batch_high_water,
                max_dwell: Duration::from_millis(self.storage.max_dwell_ms),
            },
            batch_cap: self.storage.batch_cap,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logger.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logger.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            filter.parse::<DeviceFilter>().map_err(|e| anyhow!(e))?;
        }

        if self.usb.transfer_size == 0 {
            return Err(anyhow!("usb.transfer_size must be greater than 0"));
        }

        let p = &self.pipeline;
        if p.ingest_high_water > p.ingest_capacity {
            return Err(anyhow!(
                "pipeline.ingest_high_water ({}) exceeds pipeline.ingest_capacity ({})",
                p.ingest_high_water,
                p.ingest_capacity
            ));
        }
        if p.line_ceiling == 0 || p.line_ceiling >= p.ingest_high_water {
            return Err(anyhow!(
                "pipeline.line_ceiling ({}) must be between 1 and ingest_high_water ({})",
                p.line_ceiling,
                p.ingest_high_water
            ));
        }
        if p.lines_per_cycle == 0 {
            return Err(anyhow!("pipeline.lines_per_cycle must be at least 1"));
        }

        let s = &self.storage;
        if s.batch_high_water > s.batch_cap {
            return Err(anyhow!(
                "storage.batch_high_water ({}) exceeds storage.batch_cap ({})",
                s.batch_high_water,
                s.batch_cap
            ));
        }
        if p.reassembly_period_ms == 0 || p.reassembly_period_ms >= s.persist_period_ms {
            return Err(anyhow!(
                "pipeline.reassembly_period_ms ({}) must be non-zero and shorter than storage.persist_period_ms ({})",
                p.reassembly_period_ms,
                s.persist_period_ms
            ));
        }

        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<LoggerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    LoggerConfig::load(Some(path_buf))
}
