//! Pipe-delimited SMS telemetry protocol.
//!
//! ```text
//! <TYPE>|<PATIENT_ID>|<LAT,LON|NO_GPS_FIX>|<GPS_STATUS>|<HH:MM:SS>|[Impact:<float>g]|[Device:<name>]
//! ```

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Utc};
use parking_lot::Mutex;
use regex::Regex;
use vitals_core::{GeoPoint, PipelineConfig, SmsError, TelemetryEvent, TelemetryKind};

use crate::normalizer::leading_number;

pub const NO_GPS_FIX: &str = "NO_GPS_FIX";

/// Stateless parser holding the field defaults.
#[derive(Debug, Clone)]
pub struct SmsParser {
    default_device_type: String,
    offset: FixedOffset,
}

impl SmsParser {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            default_device_type: config.sms_default_device_type.clone(),
            offset: config.sms_offset().unwrap_or_else(|| Utc.fix()),
        }
    }

    /// Decode one message. `now` supplies the date for the time-of-day field.
    pub fn parse(
        &self,
        message: &str,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, SmsError> {
        let parts: Vec<&str> = message.trim().split('|').collect();
        if parts.len() < 5 {
            return Err(SmsError::TooFewFields(parts.len()));
        }

        let type_token = parts[0].trim();
        let kind = TelemetryKind::from_wire(type_token)
            .ok_or_else(|| SmsError::UnknownType(type_token.to_string()))?;

        let mut impact_force_g = 0.0;
        let mut device_type = self.default_device_type.clone();
        for field in &parts[5..] {
            let field = field.trim();
            if let Some(caps) = impact_pattern().captures(field) {
                impact_force_g = leading_number(&caps[1]).unwrap_or(0.0);
            }
            if let Some(caps) = device_pattern().captures(field) {
                device_type = caps[1].to_string();
            }
        }

        Ok(TelemetryEvent {
            kind,
            patient_identifier: parts[1].trim().to_string(),
            location: parse_coordinates(parts[2].trim()),
            gps_status: parts[3].trim().to_string(),
            impact_force_g,
            device_type,
            sender: sender.to_string(),
            raw_message: message.to_string(),
            timestamp: self.timestamp_for(parts[4].trim(), now),
        })
    }

    // The wire carries no date; the time is placed on `now`'s date in the
    // device's offset.
    fn timestamp_for(&self, time_of_day: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        if !time_of_day.contains(':') {
            return now;
        }
        let mut fields = time_of_day.split(':').map(|f| f.trim().parse::<u32>());
        let (Some(Ok(hour)), Some(Ok(minute))) = (fields.next(), fields.next()) else {
            return now;
        };
        let second = match fields.next() {
            Some(Ok(second)) => second,
            Some(Err(_)) => return now,
            None => 0,
        };
        let Some(time) = NaiveTime::from_hms_opt(hour, minute, second) else {
            return now;
        };

        now.with_timezone(&self.offset)
            .date_naive()
            .and_time(time)
            .and_local_timezone(self.offset)
            .single()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(now)
    }
}

fn parse_coordinates(field: &str) -> Option<GeoPoint> {
    if field == NO_GPS_FIX {
        return None;
    }
    let (lat, lon) = field.split_once(',')?;
    if lon.contains(',') {
        return None;
    }
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    let valid = lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon);
    valid.then_some(GeoPoint { lat, lon })
}

fn impact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Impact:([\d.]+)g").expect("static pattern compiles"))
}

fn device_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Device:(.+)").expect("static pattern compiles"))
}

/// Drops an identical `(sender, text)` pair seen within the window.
#[derive(Debug)]
pub struct SmsDeduplicator {
    window: Duration,
    seen: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl SmsDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record the pair and return `true` unless it was accepted within the
    /// window. Entries older than the window are pruned on every call.
    pub fn try_accept(&self, sender: &str, message: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock();
        seen.retain(|_, accepted| now - *accepted < self.window);

        let key = (sender.to_string(), message.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn parser() -> SmsParser {
        SmsParser::new(&PipelineConfig::default())
    }

    #[test]
    fn fall_alert_parses_every_field() {
        let event = parser()
            .parse(
                "FALL_ALERT|PATIENT_001|9.723517,76.726443|GPS_OK|20:41:59|Impact:2.51g|Device:PiZero",
                "+15550100",
                now(),
            )
            .unwrap();
        assert_eq!(event.kind, TelemetryKind::FallAlert);
        assert_eq!(event.patient_identifier, "PATIENT_001");
        assert_eq!(
            event.location,
            Some(GeoPoint {
                lat: 9.723517,
                lon: 76.726443
            })
        );
        assert_eq!(event.gps_status, "GPS_OK");
        assert_eq!(event.impact_force_g, 2.51);
        assert_eq!(event.device_type, "PiZero");
        assert_eq!(event.sender, "+15550100");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 3, 1, 20, 41, 59).unwrap()
        );
    }

    #[test]
    fn optional_fields_in_any_order_with_defaults() {
        let p = parser();
        let event = p
            .parse(
                "FALL_ALERT|P7|1.0,2.0|GPS_OK|08:00:00|Device:Pi4|Impact:0.65g",
                "s",
                now(),
            )
            .unwrap();
        assert_eq!(event.device_type, "Pi4");
        assert_eq!(event.impact_force_g, 0.65);

        let bare = p
            .parse("LOCATION_UPDATE|P7|1.0,2.0|GPS_OK|08:00:00", "s", now())
            .unwrap();
        assert_eq!(bare.kind, TelemetryKind::LocationUpdate);
        assert_eq!(bare.device_type, "PiZero");
        assert_eq!(bare.impact_force_g, 0.0);
    }

    #[test]
    fn no_fix_and_malformed_coordinates_drop_location_only() {
        let p = parser();
        for coords in [NO_GPS_FIX, "abc,def", "1.0", "1,2,3", "91.0,0.0", ""] {
            let message = format!("LOCATION_UPDATE|P1|{coords}|NO_FIX|10:00:00");
            let event = p.parse(&message, "s", now()).unwrap();
            assert_eq!(event.location, None, "coords {coords:?}");
        }
    }

    #[test]
    fn rejects_short_messages_and_unknown_types() {
        let p = parser();
        assert_eq!(
            p.parse("FALL_ALERT|P1|1,2|GPS_OK", "s", now()),
            Err(SmsError::TooFewFields(4))
        );
        assert_eq!(
            p.parse("fall_alert|P1|1,2|GPS_OK|10:00:00", "s", now()),
            Err(SmsError::UnknownType("fall_alert".into()))
        );
        assert!(p.parse("hello there", "s", now()).is_err());
    }

    #[test]
    fn unreadable_time_falls_back_to_now() {
        let p = parser();
        for time in ["--", "25:00:00", "aa:bb", "12:xx:00"] {
            let message = format!("LOCATION_UPDATE|P1|1,2|GPS_OK|{time}");
            assert_eq!(p.parse(&message, "s", now()).unwrap().timestamp, now());
        }
        let short = p
            .parse("LOCATION_UPDATE|P1|1,2|GPS_OK|07:30", "s", now())
            .unwrap();
        assert_eq!(
            short.timestamp,
            Utc.with_ymd_and_hms(2026, 3, 1, 7, 30, 0).unwrap()
        );
    }

    #[test]
    fn time_of_day_uses_device_offset() {
        let config = PipelineConfig {
            sms_utc_offset_minutes: 330,
            ..PipelineConfig::default()
        };
        let p = SmsParser::new(&config);
        // 12:00 UTC is 17:30 at +05:30, so the local date is still March 1st.
        let event = p
            .parse("LOCATION_UPDATE|P1|1,2|GPS_OK|20:41:59", "s", now())
            .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 3, 1, 15, 11, 59).unwrap()
        );
    }

    #[test]
    fn dedup_window_is_per_sender_and_text() {
        let dedup = SmsDeduplicator::new(Duration::seconds(5));
        let t0 = now();
        assert!(dedup.try_accept("a", "msg", t0));
        assert!(!dedup.try_accept("a", "msg", t0 + Duration::seconds(4)));
        assert!(dedup.try_accept("b", "msg", t0 + Duration::seconds(4)));
        assert!(dedup.try_accept("a", "other", t0 + Duration::seconds(4)));
        assert!(dedup.try_accept("a", "msg", t0 + Duration::seconds(6)));
    }

    #[test]
    fn dedup_prunes_expired_entries() {
        let dedup = SmsDeduplicator::new(Duration::seconds(5));
        let t0 = now();
        dedup.try_accept("a", "1", t0);
        dedup.try_accept("a", "2", t0);
        assert_eq!(dedup.len(), 2);
        dedup.try_accept("a", "3", t0 + Duration::seconds(10));
        assert_eq!(dedup.len(), 1);
    }
}
