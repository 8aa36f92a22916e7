//! Template registry and device set expansion.
//!
//! The configuration is joined once at startup into a [`TargetTable`]: an
//! arena of [`PollTarget`]s indexed by scan interval (for scheduling) and by
//! endpoint (for connection pooling). The table is immutable afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use modflux_common::Tags;

use crate::config::{BridgeConfig, ConfigError, TemplateConfig};
use crate::decoder::{DataType, WordOrder};

/// A Modbus TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A resolved register field.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    pub address: u16,
    pub name: String,
    pub data_type: DataType,
    /// Effective word order (field override, else template default).
    pub word_order: WordOrder,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub tags: Tags,
}

impl RegisterField {
    /// Offset of this field's first register inside a read starting at `start`.
    pub fn offset_in(&self, start: u16) -> usize {
        usize::from(self.address - start)
    }

    pub fn word_count(&self) -> usize {
        usize::from(self.data_type.word_count())
    }

    /// Whether a linear transform applies, turning the value into a float.
    pub fn is_scaled(&self) -> bool {
        self.scale.is_some() || self.offset.is_some()
    }
}

/// A resolved, immutable template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub interval: Duration,
    /// Fields ordered by address.
    pub fields: Vec<RegisterField>,
    /// First register of the single read covering every field.
    pub start: u16,
    /// Number of registers in that read.
    pub span: u16,
}

impl Template {
    /// Resolve a validated template configuration.
    fn resolve(name: &str, config: &TemplateConfig) -> Self {
        let mut fields: Vec<RegisterField> = config
            .fields
            .iter()
            .map(|f| RegisterField {
                address: f.address,
                name: f.name.clone(),
                data_type: f.data_type,
                word_order: f.word_order.unwrap_or(config.word_order),
                scale: f.scale,
                offset: f.offset,
                tags: f.tags.clone(),
            })
            .collect();
        fields.sort_by_key(|f| f.address);

        let start = fields.first().map(|f| f.address).unwrap_or(0);
        let end = config
            .fields
            .iter()
            .map(|f| f.end())
            .max()
            .unwrap_or(u32::from(start));
        // Validation bounds the span by the Modbus read limit.
        let span = u16::try_from(end - u32::from(start)).unwrap_or(u16::MAX);

        Self {
            name: name.to_string(),
            interval: config.interval(),
            fields,
            start,
            span,
        }
    }
}

/// One device bound to its template, ready to be polled.
#[derive(Debug, Clone)]
pub struct PollTarget {
    /// Device identity as configured (numbers rendered in decimal).
    pub id: String,
    pub unit_id: u8,
    pub endpoint: Endpoint,
    pub template: Arc<Template>,
    /// Final tag set per field, parallel to `template.fields`.
    pub field_tags: Vec<Tags>,
    pub interval: Duration,
}

/// Merge `overlay` over `base`; keys present in both take the overlay value.
pub fn merge_tags(base: &Tags, overlay: &Tags) -> Tags {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Precomputed poll targets, grouped for the scheduler and the transport.
#[derive(Debug, Clone)]
pub struct TargetTable {
    targets: Vec<PollTarget>,
    by_interval: BTreeMap<Duration, Vec<usize>>,
    by_endpoint: BTreeMap<Endpoint, Vec<usize>>,
}

impl TargetTable {
    /// Validate the configuration and expand it into poll targets.
    pub fn build(config: &BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let templates: BTreeMap<&str, (Arc<Template>, &TemplateConfig)> = config
            .templates
            .iter()
            .map(|(name, t)| (name.as_str(), (Arc::new(Template::resolve(name, t)), t)))
            .collect();

        let mut targets = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let Some((template, template_config)) = templates.get(device.template.as_str()) else {
                return Err(ConfigError::UnknownTemplate {
                    device: device.id.to_string(),
                    template: device.template.clone(),
                });
            };

            let endpoint = Endpoint::new(
                device
                    .host
                    .clone()
                    .unwrap_or_else(|| config.modbus.host.clone()),
                device.port.unwrap_or(config.modbus.port),
            );

            // device > field > template
            let field_tags = template
                .fields
                .iter()
                .map(|f| merge_tags(&merge_tags(&template_config.tags, &f.tags), &device.tags))
                .collect();

            targets.push(PollTarget {
                id: device.id.to_string(),
                unit_id: device.resolved_unit_id()?,
                endpoint,
                template: Arc::clone(template),
                field_tags,
                interval: template.interval,
            });
        }

        Ok(Self::from_targets(targets))
    }

    /// Index an already-resolved set of targets.
    pub fn from_targets(targets: Vec<PollTarget>) -> Self {
        let mut by_interval: BTreeMap<Duration, Vec<usize>> = BTreeMap::new();
        let mut by_endpoint: BTreeMap<Endpoint, Vec<usize>> = BTreeMap::new();
        for (idx, target) in targets.iter().enumerate() {
            by_interval.entry(target.interval).or_default().push(idx);
            by_endpoint
                .entry(target.endpoint.clone())
                .or_default()
                .push(idx);
        }

        Self {
            targets,
            by_interval,
            by_endpoint,
        }
    }

    pub fn targets(&self) -> &[PollTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets grouped by scan interval, shortest first.
    pub fn by_interval(&self) -> impl Iterator<Item = (Duration, Vec<&PollTarget>)> + '_ {
        self.by_interval
            .iter()
            .map(|(interval, idx)| (*interval, idx.iter().map(|&i| &self.targets[i]).collect()))
    }

    /// Distinct endpoints across all targets.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> + '_ {
        self.by_endpoint.keys()
    }

    /// Targets sharing an endpoint.
    pub fn at_endpoint(&self, endpoint: &Endpoint) -> Vec<&PollTarget> {
        self.by_endpoint
            .get(endpoint)
            .map(|idx| idx.iter().map(|&i| &self.targets[i]).collect())
            .unwrap_or_default()
    }
}
