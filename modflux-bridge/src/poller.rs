//! Poll execution and sample building.

use std::sync::Arc;

use modflux_common::{FieldValue, Sample, current_timestamp_millis};
use modflux_influx::SinkHandle;
use tracing::{debug, warn};

use crate::decoder::decode;
use crate::health::{DeviceStatus, PollHealth};
use crate::registry::{PollTarget, RegisterField};
use crate::transport::{ConnectionPool, Phase, TransportError};

/// Result of one successful poll attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Samples built from the response.
    pub produced: usize,
    /// Fields that could not be turned into a sample.
    pub skipped: usize,
    /// Samples the sink buffer accepted.
    pub accepted: usize,
}

/// Reads targets through the connection pool and hands samples to the sink.
#[derive(Debug)]
pub struct Poller {
    pool: ConnectionPool,
    sink: SinkHandle,
    health: Arc<PollHealth>,
}

impl Poller {
    pub fn new(pool: ConnectionPool, sink: SinkHandle, health: Arc<PollHealth>) -> Self {
        Self { pool, sink, health }
    }

    pub fn health(&self) -> &Arc<PollHealth> {
        &self.health
    }

    /// Poll one target: a single read covering the template span, decoded
    /// into one sample per field, all sharing the timestamp of the attempt.
    pub async fn poll(&self, target: &PollTarget) -> Result<PollReport, TransportError> {
        let timestamp = current_timestamp_millis();
        let template = &target.template;

        let connection =
            self.pool
                .get(&target.endpoint)
                .ok_or_else(|| TransportError::Unavailable {
                    endpoint: target.endpoint.clone(),
                    phase: Phase::Connect,
                    reason: "no connection configured for endpoint".to_string(),
                })?;

        let words = connection
            .read_input_registers(target.unit_id, template.start, template.span)
            .await?;

        let (samples, skipped) = build_samples(target, &words, timestamp);
        let produced = samples.len();
        let accepted = self.sink.enqueue(samples);

        Ok(PollReport {
            produced,
            skipped,
            accepted,
        })
    }

    /// Poll one target and record the outcome. Never fails.
    pub async fn poll_and_record(&self, target: &PollTarget) -> bool {
        match self.poll(target).await {
            Ok(report) => {
                self.health
                    .record_success(&target.id, report.produced, report.skipped);
                debug!(
                    device = %target.id,
                    produced = report.produced,
                    skipped = report.skipped,
                    accepted = report.accepted,
                    "Poll complete"
                );
                true
            }
            Err(e) => {
                let status = self.health.record_failure(&target.id, &e.to_string());
                let phase = e.phase().map(|p| p.to_string());
                warn!(
                    device = %target.id,
                    endpoint = %target.endpoint,
                    unit = target.unit_id,
                    phase = phase.as_deref().unwrap_or("response"),
                    status = %status,
                    error = %e,
                    "Poll failed"
                );
                if status == DeviceStatus::Offline {
                    debug!(device = %target.id, "Device offline, retrying on its next tick");
                }
                false
            }
        }
    }
}

/// Build one sample per field from a response buffer starting at the
/// template's first register.
///
/// Returns the samples and the number of fields skipped because they could
/// not be decoded or produced a non-finite value.
pub fn build_samples(target: &PollTarget, words: &[u16], timestamp: i64) -> (Vec<Sample>, usize) {
    let template = &target.template;
    let mut samples = Vec::with_capacity(template.fields.len());
    let mut skipped = 0;

    for (field, tags) in template.fields.iter().zip(&target.field_tags) {
        let offset = field.offset_in(template.start);
        let Some(slice) = words.get(offset..offset + field.word_count()) else {
            warn!(
                device = %target.id,
                field = %field.name,
                "Response does not cover field, skipping"
            );
            skipped += 1;
            continue;
        };

        let value = match decode(slice, field.data_type, field.word_order) {
            Ok(value) => field_value(field, value.into()),
            Err(e) => {
                warn!(device = %target.id, field = %field.name, error = %e, "Decode failed, skipping");
                skipped += 1;
                continue;
            }
        };

        if !value.is_finite() {
            debug!(device = %target.id, field = %field.name, "Non-finite value, skipping");
            skipped += 1;
            continue;
        }

        samples.push(Sample::new(&field.name, value, timestamp).with_tags(tags.clone()));
    }

    (samples, skipped)
}

/// Apply the field's `value * scale + offset` transform, if any.
fn field_value(field: &RegisterField, raw: FieldValue) -> FieldValue {
    if field.is_scaled() {
        FieldValue::Float(raw.as_f64() * field.scale.unwrap_or(1.0) + field.offset.unwrap_or(0.0))
    } else {
        raw
    }
}
