use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vitals_core::{AlertEvent, Patient, PatientResolution, PipelineConfig};
use vitals_ingest::{IngestOrchestrator, MemoryStore, RawFragment, Sinks, SmsOutcome};

#[derive(Parser, Debug)]
#[command(
    name = "vitals-cli",
    about = "Replay a recorded BLE/SMS telemetry session through the ingest pipeline."
)]
struct Args {
    /// Session script, one command per line.
    #[arg(short, long)]
    input: PathBuf,

    /// Pipeline configuration as JSON; omitted keys keep their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Patient known to the directory, as `id:notes`. Repeatable.
    #[arg(short, long = "patient")]
    patients: Vec<String>,

    /// RFC 3339 time that `@0` maps to. Defaults to now.
    #[arg(long)]
    start: Option<String>,

    /// Print reports as JSON lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {:?}", path))?;
            serde_json::from_str::<PipelineConfig>(&raw)
                .with_context(|| format!("invalid config {:?}", path))?
        }
        None => PipelineConfig::default(),
    };
    let script = std::fs::read_to_string(&args.input)
        .with_context(|| format!("cannot read session {:?}", args.input))?;
    let start = match &args.start {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid --start {raw:?}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let store = Arc::new(MemoryStore::new());
    for spec in &args.patients {
        store.add_patient(parse_patient(spec)?);
    }
    let pipeline = IngestOrchestrator::new(config, Sinks::from_store(store.clone()))?;
    tracing::info!(session = %args.input.display(), %start, "replaying session");

    let mut clock = start;
    for (index, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (at, command) =
            split_clock(line, start, clock).with_context(|| format!("line {}", index + 1))?;
        clock = at;
        run(&pipeline, command, clock, args.json)
            .await
            .with_context(|| format!("line {}: {line}", index + 1))?;
    }
    pipeline.close().await;

    println!(
        "Vitals stored: {}\nFall events: {}\nSleep rows: {}\nLocations: {}\nAlerts stored: {}\nNotifications: {}",
        store.vitals().len(),
        store.fall_events().len(),
        store.sleep_records().len(),
        store.locations().len(),
        store.alerts().len(),
        store.notifications().len(),
    );
    Ok(())
}

fn parse_patient(spec: &str) -> anyhow::Result<Patient> {
    let Some((id, notes)) = spec.split_once(':') else {
        bail!("patient must be `id:notes`, got {spec:?}");
    };
    Ok(Patient {
        id: id.trim().to_string(),
        first_name: "Patient".to_string(),
        last_name: id.trim().to_string(),
        notes: Some(notes.trim().to_string()),
    })
}

// `@<secs> rest` moves the clock; lines without a prefix reuse the last time.
fn split_clock(
    line: &str,
    start: DateTime<Utc>,
    clock: DateTime<Utc>,
) -> anyhow::Result<(DateTime<Utc>, &str)> {
    let Some(stamped) = line.strip_prefix('@') else {
        return Ok((clock, line));
    };
    let (offset, rest) = stamped.split_once(' ').unwrap_or((stamped, ""));
    let seconds: f64 = offset
        .parse()
        .with_context(|| format!("invalid clock offset {offset:?}"))?;
    if !(seconds.is_finite() && seconds >= 0.0) {
        bail!("clock offset must be a non-negative number, got {offset}");
    }
    let Some(at) = Duration::try_milliseconds((seconds * 1000.0).round() as i64)
        .and_then(|offset| start.checked_add_signed(offset))
    else {
        bail!("clock offset {offset} is out of range");
    };
    Ok((at, rest.trim_start()))
}

fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    input.split_once(' ').unwrap_or((input, ""))
}

async fn run(
    pipeline: &IngestOrchestrator,
    command: &str,
    now: DateTime<Utc>,
    json: bool,
) -> anyhow::Result<()> {
    let (verb, rest) = next_word(command);
    match verb {
        "connect" => {
            let (device, rest) = next_word(rest);
            let (patient, _) = next_word(rest);
            if device.is_empty() || patient.is_empty() {
                bail!("usage: connect <device> <patient>");
            }
            pipeline.connect_device_at(device, patient, now);
        }
        "disconnect" => {
            let (device, rest) = next_word(rest);
            let reset = next_word(rest).0 == "reset";
            if !pipeline.disconnect_device(device, reset) {
                println!("{now} {device} was not connected");
            }
        }
        "ble" | "ble64" => {
            let (device, payload) = next_word(rest);
            let fragment = if verb == "ble64" {
                RawFragment::Base64(payload.trim().to_string())
            } else {
                RawFragment::Text(payload.to_string())
            };
            let report = pipeline.ingest_ble_at(device, fragment, now).await?;
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                for sample in &report.samples {
                    println!(
                        "{now} {device} hr={} spo2={} temp={} finger={} fall={}",
                        sample.heart_rate,
                        sample.spo2,
                        sample.temperature_c,
                        sample.finger_present,
                        sample.fall_detected
                    );
                }
                print_alerts(now, &report.alerts);
            }
        }
        "sms" => {
            let (sender, message) = next_word(rest);
            match pipeline.ingest_sms_at(message, sender, now).await? {
                SmsOutcome::Accepted(report) if json => {
                    println!("{}", serde_json::to_string(&report)?);
                }
                SmsOutcome::Accepted(report) => {
                    let how = match &report.resolution {
                        PatientResolution::Resolved { .. } => "resolved".to_string(),
                        PatientResolution::Fallback { reason, .. } => format!("fallback {reason:?}"),
                        PatientResolution::Placeholder { .. } => "placeholder".to_string(),
                    };
                    println!(
                        "{now} sms {} from {sender} -> {} ({how})",
                        report.event.kind.as_wire(),
                        report.resolution.patient().display_name()
                    );
                    if let Some(zone) = report.zone_created {
                        println!("{now} zone {zone} created around fall");
                    }
                    print_alerts(now, &report.alerts);
                }
                SmsOutcome::Duplicate => println!("{now} sms from {sender} ignored: duplicate"),
                SmsOutcome::Rejected(reason) => println!("{now} sms from {sender} ignored: {reason}"),
            }
        }
        "gps" => {
            let (patient, rest) = next_word(rest);
            let (lat, rest) = next_word(rest);
            let (lon, _) = next_word(rest);
            let alerts = pipeline.ingest_location_at(patient, lat.parse()?, lon.parse()?, now)?;
            print_alerts(now, &alerts);
        }
        "zone" => {
            let (patient, rest) = next_word(rest);
            let (lat, rest) = next_word(rest);
            let (lon, rest) = next_word(rest);
            let (radius, _) = next_word(rest);
            let id = pipeline
                .upsert_zone_at(patient, lat.parse()?, lon.parse()?, radius.parse()?, now)
                .await?;
            println!("{now} zone {id} for {patient}");
        }
        "unzone" => {
            let id: Uuid = next_word(rest).0.parse()?;
            let removed = pipeline.remove_zone(id).await?;
            println!("{now} zone {id} removed: {removed}");
        }
        other => bail!("unknown command {other:?}"),
    }
    Ok(())
}

fn print_alerts(now: DateTime<Utc>, alerts: &[AlertEvent]) {
    for alert in alerts {
        println!(
            "{now} ALERT {} [{:?}] {}: {}",
            alert.kind, alert.priority, alert.patient_id, alert.message
        );
    }
}
