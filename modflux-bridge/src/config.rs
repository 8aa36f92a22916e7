//! Configuration for the Modbus-to-InfluxDB bridge.

use modflux_common::{LoggingConfig, Tags};
use modflux_influx::InfluxConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::decoder::{DataType, WordOrder};

/// Largest register count a single "read input registers" request may ask for.
pub const MAX_READ_REGISTERS: u32 = 125;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Device '{device}': unknown template '{template}'")]
    UnknownTemplate { device: String, template: String },
    #[error("Template '{template}': field '{first}' overlaps field '{second}'")]
    OverlappingFields {
        template: String,
        first: String,
        second: String,
    },
    #[error("Duplicate device id '{0}'")]
    DuplicateDevice(String),
    #[error("{0} must be greater than zero")]
    NonPositiveDuration(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Modbus transport settings
    pub modbus: ModbusConfig,

    /// Sink settings
    pub influxdb: InfluxConfig,

    /// Named register templates
    pub templates: BTreeMap<String, TemplateConfig>,

    /// Devices to poll
    pub devices: Vec<DeviceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Period of the health/statistics log line in seconds (0 disables it)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stats_interval() -> u64 {
    60
}

/// Modbus TCP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Connect and response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Polls running at once within one interval group
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_concurrent_polls() -> usize {
    16
}

impl ModbusConfig {
    /// Connect/response timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A reusable register map and sampling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Scan interval in milliseconds
    pub scan_interval_ms: u64,

    /// Register order of multi-register values
    #[serde(default)]
    pub word_order: WordOrder,

    /// Tags applied to every sample of every device using this template
    #[serde(default)]
    pub tags: Tags,

    /// Register fields
    pub fields: Vec<FieldConfig>,
}

impl TemplateConfig {
    /// Scan interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// One typed value in a template's register map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Starting input register address (0-based)
    pub address: u16,

    /// Field name (used as the measurement name)
    pub name: String,

    /// Data type
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Override of the template word order
    #[serde(default)]
    pub word_order: Option<WordOrder>,

    /// Scaling factor (value * scale)
    #[serde(default)]
    pub scale: Option<f64>,

    /// Offset (value * scale + offset)
    #[serde(default)]
    pub offset: Option<f64>,

    /// Per-field tags (e.g. unit)
    #[serde(default)]
    pub tags: Tags,
}

impl FieldConfig {
    /// Address one past the last register of this field.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.data_type.word_count())
    }
}

/// Device identity: a number (doubling as the unit id) or a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Number(u64),
    Name(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Number(n) => write!(f, "{}", n),
            DeviceId::Name(s) => f.write_str(s),
        }
    }
}

/// Configuration for a single Modbus device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identity
    pub id: DeviceId,

    /// Template name
    pub template: String,

    /// Modbus unit/slave ID (1-247); defaults to a numeric `id`
    #[serde(default)]
    pub unit_id: Option<u8>,

    /// Host override for this device
    #[serde(default)]
    pub host: Option<String>,

    /// Port override for this device
    #[serde(default)]
    pub port: Option<u16>,

    /// Device tags, taking precedence over template and field tags
    #[serde(default)]
    pub tags: Tags,
}

impl DeviceConfig {
    /// Resolve the Modbus unit id from `unit_id` or a numeric `id`.
    pub fn resolved_unit_id(&self) -> Result<u8, ConfigError> {
        let unit = match (self.unit_id, &self.id) {
            (Some(unit), _) => u64::from(unit),
            (None, DeviceId::Number(n)) => *n,
            (None, DeviceId::Name(_)) => {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': unit_id is required when id is not numeric",
                    self.id
                )));
            }
        };

        match u8::try_from(unit) {
            Ok(unit @ 1..=247) => Ok(unit),
            _ => Err(ConfigError::Validation(format!(
                "Device '{}': unit_id must be 1-247, got {}",
                self.id, unit
            ))),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_durations()?;

        if self.modbus.host.is_empty() {
            return Err(ConfigError::Validation(
                "modbus.host cannot be empty".to_string(),
            ));
        }
        if self.modbus.max_concurrent_polls == 0 {
            return Err(ConfigError::Validation(
                "modbus.max_concurrent_polls must be at least 1".to_string(),
            ));
        }
        if self.influxdb.url.is_empty() {
            return Err(ConfigError::Validation(
                "influxdb.url cannot be empty".to_string(),
            ));
        }
        if self.influxdb.batch_size == 0 || self.influxdb.max_buffered_samples == 0 {
            return Err(ConfigError::Validation(
                "influxdb.batch_size and influxdb.max_buffered_samples must be at least 1"
                    .to_string(),
            ));
        }

        for (name, template) in &self.templates {
            validate_template(name, template)?;
        }

        if self.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            let id = device.id.to_string();
            if id.is_empty() {
                return Err(ConfigError::Validation(
                    "Device id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateDevice(id));
            }

            if !self.templates.contains_key(&device.template) {
                return Err(ConfigError::UnknownTemplate {
                    device: id,
                    template: device.template.clone(),
                });
            }

            device.resolved_unit_id()?;
            validate_tags(&format!("Device '{}'", id), &device.tags)?;

            if device.host.as_deref() == Some("") {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': host cannot be empty",
                    id
                )));
            }
        }

        Ok(())
    }

    fn validate_durations(&self) -> Result<(), ConfigError> {
        let mut durations = vec![("modbus.timeout_ms".to_string(), self.modbus.timeout_ms)];
        durations.extend(
            self.influxdb
                .durations_ms()
                .into_iter()
                .map(|(name, ms)| (name.to_string(), ms)),
        );
        durations.extend(self.templates.iter().map(|(name, t)| {
            (
                format!("templates.{}.scan_interval_ms", name),
                t.scan_interval_ms,
            )
        }));

        match durations.into_iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(ConfigError::NonPositiveDuration(name)),
            None => Ok(()),
        }
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\n', '\r'])
}

/// Tags end up in line protocol: keys must be non-empty and nothing may span lines.
fn validate_tags(owner: &str, tags: &Tags) -> Result<(), ConfigError> {
    for (key, value) in tags {
        if key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}: tag key cannot be empty",
                owner
            )));
        }
        if has_line_break(key) || has_line_break(value) {
            return Err(ConfigError::Validation(format!(
                "{}: tag {:?} contains a line break",
                owner, key
            )));
        }
    }
    Ok(())
}

fn validate_template(name: &str, template: &TemplateConfig) -> Result<(), ConfigError> {
    if template.fields.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Template '{}': at least one field is required",
            name
        )));
    }

    validate_tags(&format!("Template '{}'", name), &template.tags)?;

    let mut names = HashSet::new();
    for field in &template.fields {
        if field.name.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Template '{}': field name cannot be empty",
                name
            )));
        }
        if has_line_break(&field.name) {
            return Err(ConfigError::Validation(format!(
                "Template '{}': field name {:?} contains a line break",
                name, field.name
            )));
        }
        validate_tags(
            &format!("Template '{}' field '{}'", name, field.name),
            &field.tags,
        )?;
        if !names.insert(field.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Template '{}': duplicate field name '{}'",
                name, field.name
            )));
        }
        if field.end() > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Validation(format!(
                "Template '{}': field '{}' extends past register 65535",
                name, field.name
            )));
        }
        if let Some(scale) = field.scale
            && (!scale.is_finite() || scale == 0.0)
        {
            return Err(ConfigError::Validation(format!(
                "Template '{}': field '{}' scale must be finite and non-zero",
                name, field.name
            )));
        }
        if field.offset.is_some_and(|o| !o.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "Template '{}': field '{}' offset must be finite",
                name, field.name
            )));
        }
    }

    let mut by_address: Vec<&FieldConfig> = template.fields.iter().collect();
    by_address.sort_by_key(|f| f.address);
    for pair in by_address.windows(2) {
        if pair[0].end() > u32::from(pair[1].address) {
            return Err(ConfigError::OverlappingFields {
                template: name.to_string(),
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }

    let start = u32::from(by_address[0].address);
    let end = by_address.iter().map(|f| f.end()).max().unwrap_or(start);
    if end - start > MAX_READ_REGISTERS {
        return Err(ConfigError::Validation(format!(
            "Template '{}': fields span {} registers, a single read allows at most {}",
            name,
            end - start,
            MAX_READ_REGISTERS
        )));
    }

    Ok(())
}
