//! InfluxDB line protocol encoding.
//!
//! Each sample becomes one line:
//!
//! ```text
//! <measurement>[,<tag>=<value>...] value=<field> <timestamp-ms>
//! ```

use std::fmt::Write;

use modflux_common::{FieldValue, Sample};

/// Field key used for every sample value.
pub const FIELD_KEY: &str = "value";

/// Encode a batch of samples, one line each.
pub fn encode_batch(samples: &[Sample]) -> String {
    let mut out = String::with_capacity(samples.len() * 96);
    for sample in samples {
        encode_sample(sample, &mut out);
        out.push('\n');
    }
    out
}

/// Append one sample in line protocol to `out` (without the trailing newline).
pub fn encode_sample(sample: &Sample, out: &mut String) {
    out.push_str(&escape_measurement(&sample.measurement));

    // Empty tag values are not representable
    for (key, value) in sample.tags.iter().filter(|(_, v)| !v.is_empty()) {
        out.push(',');
        out.push_str(&escape_tag(key));
        out.push('=');
        out.push_str(&escape_tag(value));
    }

    out.push(' ');
    out.push_str(FIELD_KEY);
    out.push('=');
    write_field_value(out, &sample.value);

    let _ = write!(out, " {}", sample.timestamp);
}

fn write_field_value(out: &mut String, value: &FieldValue) {
    let _ = match *value {
        FieldValue::Float(v) => write!(out, "{v}"),
        FieldValue::Integer(v) => write!(out, "{v}i"),
        // Plain integers keep 1.x servers happy; only out-of-range values fall back to float
        FieldValue::Unsigned(v) if v <= i64::MAX as u64 => write!(out, "{v}i"),
        FieldValue::Unsigned(v) => write!(out, "{}", v as f64),
    };
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
