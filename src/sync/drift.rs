//! Drift detection between a prior mirror value and a fresh remote value

use crate::domain::{FieldDrift, SyncPolicy};

/// Read a field as a number; numeric strings count (remote APIs often send
/// money as `"1300.00"`)
fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// `|current - previous| / |previous|`, infinite when a zero value moved
pub fn relative_delta(previous: f64, current: f64) -> f64 {
    if previous == current {
        return 0.0;
    }
    if previous == 0.0 {
        return f64::INFINITY;
    }
    (current - previous).abs() / previous.abs()
}

/// Significant fields whose relative change exceeds the policy threshold.
///
/// Compares the policy's `drift_fields`, or every top-level field numeric on
/// both sides when none are configured. A field missing or non-numeric on
/// either side is skipped. The threshold is exclusive.
pub fn detect_drift(
    previous: &serde_json::Value,
    current: &serde_json::Value,
    policy: &SyncPolicy,
) -> Vec<FieldDrift> {
    let fields: Vec<String> = if policy.drift_fields.is_empty() {
        match previous.as_object() {
            Some(map) => map.keys().cloned().collect(),
            None => Vec::new(),
        }
    } else {
        policy.drift_fields.clone()
    };

    fields
        .into_iter()
        .filter_map(|field| {
            let before = numeric(previous.get(&field)?)?;
            let after = numeric(current.get(&field)?)?;
            let delta = relative_delta(before, after);
            (delta > policy.drift_threshold).then(|| FieldDrift {
                field,
                previous: before,
                current: after,
                relative_delta: delta,
            })
        })
        .collect()
}
