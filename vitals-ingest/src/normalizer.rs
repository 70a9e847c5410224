//! BLE frame to [`VitalsSample`] conversion.
//!
//! Firmware revisions disagree on key names. Each field is read from the
//! compact key first, then the verbose camelCase key, then the legacy
//! snake_case key. Values that cannot be coerced become zero or `false`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use vitals_core::{Acceleration, IngestError, VitalsSample};

/// Identity attached to every sample decoded for one device.
#[derive(Debug, Clone, Copy)]
pub struct SampleContext<'a> {
    pub device_id: &'a str,
    pub patient_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Convert one parsed frame into a canonical sample.
pub fn normalize(frame: &Value, ctx: &SampleContext<'_>) -> Result<VitalsSample, IngestError> {
    let Some(obj) = frame.as_object() else {
        return Err(IngestError::NotAnObject);
    };

    let acceleration = Acceleration::from_axes(
        axis(obj, "ax", "accelX", "x"),
        axis(obj, "ay", "accelY", "y"),
        axis(obj, "az", "accelZ", "z"),
    );

    let fall_detected = if let Some(flag) = obj.get("em") {
        is_one(flag)
    } else if let Some(status) = obj.get("emergency") {
        status.as_str() == Some("ACTIVE")
    } else {
        permissive_bool(obj.get("fall_detected"))
    };

    let is_sleeping = if let Some(flag) = obj.get("sl") {
        flag.as_str() == Some("S")
    } else if let Some(status) = obj.get("sleepStatus") {
        status.as_str() == Some("Sleeping")
    } else {
        permissive_bool(obj.get("is_sleeping"))
    };

    Ok(VitalsSample {
        device_id: ctx.device_id.to_string(),
        patient_id: ctx.patient_id.to_string(),
        heart_rate: permissive_i32(pick(obj, &["hr", "heartRate", "heart_rate"])),
        spo2: permissive_i32(pick(obj, &["ox", "spo2", "oxygen"])),
        temperature_c: permissive_f64(pick(obj, &["tp", "temperature", "temp"])),
        finger_present: permissive_bool(pick(obj, &["fd", "fingerDetected", "finger_present"])),
        signal_quality: permissive_f64(pick(obj, &["sq", "signalQuality", "signal_quality"])),
        acceleration,
        fall_detected,
        is_sleeping,
        sleep_quality: permissive_i32(pick(obj, &["ss", "sleepScore", "sleep_quality"])),
        step_count: permissive_i32(pick(obj, &["sc", "stepCount", "step_count"])),
        timestamp: ctx.timestamp,
    })
}

// A present key wins even when its value is null.
fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn axis(obj: &Map<String, Value>, compact: &str, verbose: &str, nested: &str) -> f64 {
    let value = pick(obj, &[compact, verbose])
        .or_else(|| obj.get("acceleration").and_then(|accel| accel.get(nested)));
    permissive_f64(value)
}

fn is_one(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s.trim() == "1",
        Value::Bool(b) => *b,
        _ => false,
    }
}

pub(crate) fn permissive_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Some(Value::String(s)) => leading_number(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn permissive_i32(value: Option<&Value>) -> i32 {
    // Saturating cast; fractional parts are truncated.
    permissive_f64(value).trunc() as i32
}

fn permissive_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(value @ Value::Number(_)) => is_one(value),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true") || s == "1"
        }
        _ => false,
    }
}

/// Numeric prefix of a string, e.g. `"36.6C"` reads as `36.6`.
pub(crate) fn leading_number(text: &str) -> Option<f64> {
    let token = text.split_whitespace().next()?;
    let mut cleaned: String = token
        .chars()
        .enumerate()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(_, c)| c)
        .collect();
    while !cleaned.is_empty() {
        if let Ok(value) = cleaned.parse::<f64>() {
            return Some(value).filter(|v| v.is_finite());
        }
        cleaned.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> SampleContext<'static> {
        SampleContext {
            device_id: "esp32-01",
            patient_id: "patient-1",
            timestamp: DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn compact_frame_maps_every_field() {
        let frame = json!({
            "hr": 72, "ox": 97, "tp": 36.6, "fd": 1, "sq": 88.5,
            "ax": 0.0, "ay": 3.0, "az": 4.0,
            "em": 0, "sl": "A", "ss": 64, "sc": 1200
        });
        let sample = normalize(&frame, &ctx()).unwrap();
        assert_eq!(sample.device_id, "esp32-01");
        assert_eq!(sample.patient_id, "patient-1");
        assert_eq!(sample.heart_rate, 72);
        assert_eq!(sample.spo2, 97);
        assert!((sample.temperature_c - 36.6).abs() < 1e-9);
        assert!(sample.finger_present);
        assert!((sample.acceleration.magnitude - 5.0).abs() < 1e-9);
        assert!(!sample.fall_detected);
        assert!(!sample.is_sleeping);
        assert_eq!(sample.sleep_quality, 64);
        assert_eq!(sample.step_count, 1200);
    }

    #[test]
    fn verbose_keys_are_accepted() {
        let frame = json!({
            "heartRate": "81", "spo2": 95, "temperature": "37.1",
            "fingerDetected": true, "signalQuality": 70,
            "accelX": 1.0, "accelY": 0, "accelZ": 0,
            "emergency": "ACTIVE", "sleepStatus": "Sleeping",
            "sleepScore": 85, "stepCount": 20
        });
        let sample = normalize(&frame, &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 81);
        assert!((sample.temperature_c - 37.1).abs() < 1e-9);
        assert!(sample.finger_present);
        assert!(sample.fall_detected);
        assert!(sample.is_sleeping);
        assert!((sample.acceleration.magnitude - 1.0).abs() < 1e-9);
    }

    #[test]
    fn compact_key_wins_over_verbose() {
        let frame = json!({"hr": 60, "heartRate": 120, "em": 0, "emergency": "ACTIVE"});
        let sample = normalize(&frame, &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 60);
        assert!(!sample.fall_detected);
    }

    #[test]
    fn legacy_snake_case_and_nested_acceleration() {
        let frame = json!({
            "heart_rate": 66, "oxygen": 99, "temp": 36.2,
            "finger_present": "true", "fall_detected": 1,
            "acceleration": {"x": 6.0, "y": 8.0, "z": 0.0}
        });
        let sample = normalize(&frame, &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 66);
        assert_eq!(sample.spo2, 99);
        assert!(sample.finger_present);
        assert!(sample.fall_detected);
        assert!((sample.acceleration.magnitude - 10.0).abs() < 1e-9);
    }

    #[test]
    fn uncoercible_values_become_zero() {
        let frame = json!({"hr": "abc", "ox": null, "tp": [1], "fd": "maybe", "sc": "12 steps"});
        let sample = normalize(&frame, &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 0);
        assert_eq!(sample.spo2, 0);
        assert_eq!(sample.temperature_c, 0.0);
        assert!(!sample.finger_present);
        assert_eq!(sample.step_count, 12);
    }

    #[test]
    fn nan_string_coerces_to_zero() {
        let sample = normalize(&json!({"hr": "nan", "ox": 98}), &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 0);
        assert_eq!(sample.spo2, 98);
    }

    #[test]
    fn fractional_integers_truncate() {
        let sample = normalize(&json!({"hr": 72.9, "ox": "96.7"}), &ctx()).unwrap();
        assert_eq!(sample.heart_rate, 72);
        assert_eq!(sample.spo2, 96);
    }

    #[test]
    fn non_object_frames_are_rejected() {
        assert!(matches!(
            normalize(&json!([1, 2]), &ctx()),
            Err(IngestError::NotAnObject)
        ));
    }

    #[test]
    fn leading_number_reads_prefix() {
        assert_eq!(leading_number("36.6C"), Some(36.6));
        assert_eq!(leading_number("-1.5g"), Some(-1.5));
        assert_eq!(leading_number("1.2.3"), Some(1.2));
        assert_eq!(leading_number("x1"), None);
        assert_eq!(leading_number(""), None);
    }
}
