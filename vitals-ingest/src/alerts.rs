//! Threshold rules over vitals samples, plus the SMS fall alert builder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use vitals_core::{AlertEvent, AlertKind, PatientResolution, TelemetryEvent, VitalsSample};

use crate::throttle::{RecordKind, ThrottleGate};

pub const LOW_HEART_RATE_BPM: i32 = 50;
pub const HIGH_HEART_RATE_BPM: i32 = 100;
pub const LOW_SPO2_PERCENT: i32 = 90;
pub const HIGH_TEMPERATURE_C: f64 = 38.0;
pub const LOW_TEMPERATURE_C: f64 = 36.0;

/// A condition met by a sample, before throttling.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
}

/// Every threshold the sample crosses. Zero readings mean "not measured" and
/// never fire.
pub fn check_thresholds(sample: &VitalsSample) -> Vec<Finding> {
    let mut findings = Vec::new();

    if sample.fall_detected {
        let magnitude = sample.acceleration.magnitude;
        findings.push(Finding {
            kind: AlertKind::Fall,
            message: format!("Patient may have fallen. Acceleration: {magnitude:.2}g"),
            value: magnitude,
        });
    }

    let hr = sample.heart_rate;
    if hr != 0 {
        if hr < LOW_HEART_RATE_BPM {
            findings.push(Finding {
                kind: AlertKind::LowHeartRate,
                message: format!("Heart rate is {hr} BPM (below {LOW_HEART_RATE_BPM})"),
                value: f64::from(hr),
            });
        } else if hr > HIGH_HEART_RATE_BPM {
            findings.push(Finding {
                kind: AlertKind::HighHeartRate,
                message: format!("Heart rate is {hr} BPM (above {HIGH_HEART_RATE_BPM})"),
                value: f64::from(hr),
            });
        }
    }

    let spo2 = sample.spo2;
    if spo2 != 0 && spo2 < LOW_SPO2_PERCENT {
        findings.push(Finding {
            kind: AlertKind::LowSpo2,
            message: format!("SpO2 is {spo2}% (below {LOW_SPO2_PERCENT}%)"),
            value: f64::from(spo2),
        });
    }

    let temp = sample.temperature_c;
    if temp != 0.0 {
        if temp > HIGH_TEMPERATURE_C {
            findings.push(Finding {
                kind: AlertKind::HighTemperature,
                message: format!("Temperature is {temp}°C (above {HIGH_TEMPERATURE_C}°C)"),
                value: temp,
            });
        } else if temp < LOW_TEMPERATURE_C {
            findings.push(Finding {
                kind: AlertKind::LowTemperature,
                message: format!("Temperature is {temp}°C (below {LOW_TEMPERATURE_C}°C)"),
                value: temp,
            });
        }
    }

    findings
}

/// Applies the per-device, per-condition windows to threshold findings.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    gate: Arc<ThrottleGate>,
}

impl AlertEngine {
    pub fn new(gate: Arc<ThrottleGate>) -> Self {
        Self { gate }
    }

    /// Alerts to raise for one sample. A fall skips the condition window and
    /// is only collapsed with a fall reported moments earlier by the same
    /// device.
    pub fn evaluate(&self, sample: &VitalsSample, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let device = sample.device_id.as_str();
        let mut alerts = Vec::new();

        for finding in check_thresholds(sample) {
            let admitted = if finding.kind == AlertKind::Fall {
                let fresh = self
                    .gate
                    .try_acquire(device, RecordKind::FallFrame, now)
                    .is_some();
                if fresh {
                    self.gate.commit(device, RecordKind::Alert(AlertKind::Fall), now);
                }
                fresh
            } else {
                self.gate
                    .try_acquire(device, RecordKind::Alert(finding.kind), now)
                    .is_some()
            };

            if !admitted {
                tracing::debug!(device_id = device, condition = %finding.kind, "alert throttled");
                continue;
            }

            alerts.push(AlertEvent::new(
                sample.patient_id.clone(),
                finding.kind,
                finding.message,
                json!({
                    "device_id": device,
                    "source": "ble",
                    "value": finding.value,
                }),
                sample.timestamp,
            ));
        }
        alerts
    }
}

/// Critical alert for a fall reported over SMS.
pub fn sms_fall_alert(event: &TelemetryEvent, resolution: &PatientResolution) -> AlertEvent {
    let location_info = match event.location {
        Some(point) => format!(
            "Location: {:.6}, {:.6} ({})",
            point.lat, point.lon, event.gps_status
        ),
        None => format!("Location: GPS not available ({})", event.gps_status),
    };
    let message = format!(
        "Fall detected via SMS alert. {location_info} | Impact: {}g | Device: {}",
        event.impact_force_g, event.device_type
    );
    let location = event
        .location
        .map(|point| json!({"latitude": point.lat, "longitude": point.lon}));

    AlertEvent::new(
        resolution.patient().id.clone(),
        AlertKind::Fall,
        message,
        json!({
            "source": "sms",
            "device_type": event.device_type,
            "sender": event.sender,
            "impact": event.impact_force_g,
            "location": location,
            "gps_status": event.gps_status,
            "patient_id_from_sms": event.patient_identifier,
            "resolution": resolution_tag(resolution),
        }),
        event.timestamp,
    )
}

fn resolution_tag(resolution: &PatientResolution) -> &'static str {
    match resolution {
        PatientResolution::Resolved { .. } => "resolved",
        PatientResolution::Fallback { .. } => "fallback",
        PatientResolution::Placeholder { .. } => "placeholder",
    }
}
