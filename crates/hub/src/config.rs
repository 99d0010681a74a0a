//! TOML config file loading, validation, and database seeding for devices
//! and schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{Db, Schedule};
use crate::device::Device;
use crate::timecalc::{parse_time_of_day, weekday_from_abbrev};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub schedule_id: String,
    pub device_id: String,
    pub name: String,
    pub days: Vec<String>,
    pub time: String,
    pub duration_min: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_port() -> u16 {
    80
}

fn default_active() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_devices(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if d.host.trim().is_empty() {
                errors.push(format!("{}: host is empty", ctx()));
            }

            if d.port == 0 {
                errors.push(format!("{}: port must be non-zero", ctx()));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> =
            self.devices.iter().map(|d| d.device_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.schedule_id.is_empty() {
                    format!("schedules[{i}]")
                } else {
                    format!("schedule '{}'", s.schedule_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.schedule_id.trim().is_empty() {
                errors.push(format!("{}: schedule_id is empty", ctx()));
            } else if !seen_ids.insert(&s.schedule_id) {
                errors.push(format!("{}: duplicate schedule_id", ctx()));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if s.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !device_ids.contains(s.device_id.as_str()) {
                errors.push(format!(
                    "{}: device_id '{}' does not match any defined device",
                    ctx(),
                    s.device_id
                ));
            }

            // ── Recurrence ──────────────────────────────────────
            if s.active && s.days.is_empty() {
                errors.push(format!("{}: active schedule has no weekdays", ctx()));
            }

            let mut seen_days: HashSet<&str> = HashSet::new();
            for day in &s.days {
                if weekday_from_abbrev(day).is_none() {
                    errors.push(format!(
                        "{}: unknown weekday '{day}' (use Mon..Sun)",
                        ctx()
                    ));
                } else if !seen_days.insert(day) {
                    errors.push(format!("{}: duplicate weekday '{day}'", ctx()));
                }
            }

            if let Err(e) = parse_time_of_day(&s.time) {
                errors.push(format!("{}: {e}", ctx()));
            }

            if s.duration_min <= 0 {
                errors.push(format!(
                    "{}: duration_min must be positive, got {}",
                    ctx(),
                    s.duration_min
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all devices and schedules from the config into the database.
/// Existing device records keep their runtime fields (power state, session
/// bookkeeping); only the addressing columns follow the config.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let existing = db.load_devices().await?;

    for d in &config.devices {
        let record = match existing.iter().find(|e| e.device_id == d.device_id) {
            Some(e) => {
                let mut updated = e.clone();
                updated.name = d.name.clone();
                updated.host = d.host.clone();
                updated.port = d.port;
                updated
            }
            None => Device::new(&d.device_id, &d.name, &d.host, d.port),
        };
        db.upsert_device(&record)
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    for s in &config.schedules {
        db.upsert_schedule(&Schedule {
            schedule_id: s.schedule_id.clone(),
            device_id: s.device_id.clone(),
            name: s.name.clone(),
            days: s.days.clone(),
            time_of_day: s.time.clone(),
            duration_min: s.duration_min,
            active: s.active,
        })
        .await
        .with_context(|| format!("failed to upsert schedule '{}'", s.schedule_id))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        schedules = config.schedules.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_device() -> DeviceEntry {
        DeviceEntry {
            device_id: "d1".into(),
            name: "Tank 1".into(),
            host: "192.168.1.40".into(),
            port: 80,
        }
    }

    fn valid_schedule() -> ScheduleEntry {
        ScheduleEntry {
            schedule_id: "s1".into(),
            device_id: "d1".into(),
            name: "Morning clean".into(),
            days: vec!["Mon".into(), "Wed".into()],
            time: "09:00".into(),
            duration_min: 30,
            active: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            devices: vec![valid_device()],
            schedules: vec![valid_schedule()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[[devices]]
device_id = "d1"
name = "Tank 1"
host = "192.168.1.40"

[[schedules]]
schedule_id = "s1"
device_id = "d1"
name = "Morning clean"
days = ["Mon", "Wed"]
time = "09:00"
duration_min = 30
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].port, 80); // default
        assert_eq!(config.schedules.len(), 1);
        assert!(config.schedules[0].active); // default
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.schedules.is_empty());
        config.validate().unwrap();
    }

    // -- Device validation -------------------------------------------------

    #[test]
    fn device_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn device_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(valid_device());
        assert_validation_err(&cfg, "duplicate device_id");
    }

    #[test]
    fn device_empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].host = "  ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    #[test]
    fn device_port_zero_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].port = 0;
        assert_validation_err(&cfg, "port must be non-zero");
    }

    // -- Schedule validation -------------------------------------------------

    #[test]
    fn schedule_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].schedule_id = "".into();
        assert_validation_err(&cfg, "schedule_id is empty");
    }

    #[test]
    fn schedule_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.schedules.push(valid_schedule());
        assert_validation_err(&cfg, "duplicate schedule_id");
    }

    #[test]
    fn schedule_unknown_device_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].device_id = "nonexistent".into();
        assert_validation_err(&cfg, "does not match any defined device");
    }

    #[test]
    fn active_schedule_without_days_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days.clear();
        assert_validation_err(&cfg, "active schedule has no weekdays");
    }

    #[test]
    fn inactive_schedule_without_days_accepted() {
        let mut cfg = valid_config();
        cfg.schedules[0].days.clear();
        cfg.schedules[0].active = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_weekday_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days = vec!["Monday".into()];
        assert_validation_err(&cfg, "unknown weekday 'Monday'");
    }

    #[test]
    fn duplicate_weekday_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days = vec!["Mon".into(), "Mon".into()];
        assert_validation_err(&cfg, "duplicate weekday 'Mon'");
    }

    #[test]
    fn malformed_time_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].time = "25:00".into();
        assert_validation_err(&cfg, "malformed time of day");
    }

    #[test]
    fn non_positive_duration_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].duration_min = 0;
        assert_validation_err(&cfg, "duration_min must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            devices: vec![DeviceEntry {
                device_id: "".into(),
                name: "".into(),
                host: "".into(),
                port: 0,
            }],
            schedules: vec![ScheduleEntry {
                schedule_id: "".into(),
                device_id: "ghost".into(),
                name: "".into(),
                days: vec!["Funday".into()],
                time: "noon".into(),
                duration_min: -5,
                active: true,
            }],
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        assert!(msg.contains("device_id is empty"), "missing device error in: {msg}");
        assert!(msg.contains("unknown weekday"), "missing weekday error in: {msg}");
        assert!(msg.contains("malformed time"), "missing time error in: {msg}");
        assert!(
            msg.contains("duration_min must be positive"),
            "missing duration error in: {msg}"
        );
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        config.validate().unwrap();

        apply(&config, &db).await.unwrap();

        let devices = db.load_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "d1");
        assert_eq!(devices[0].host, "192.168.1.40");

        let schedules = db.load_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].schedule_id, "s1");
        assert_eq!(schedules[0].time_of_day, "09:00");
    }

    #[tokio::test]
    async fn apply_preserves_runtime_device_fields() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        // A device that already has accumulated on-time.
        let mut existing = Device::new("d1", "Old name", "10.0.0.1", 80);
        existing.total_uv_secs = 3600;
        existing.uv_session_start = Some(1000);
        existing.uv_session_end = Some(4600);
        db.upsert_device(&existing).await.unwrap();

        apply(&valid_config(), &db).await.unwrap();

        let devices = db.load_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        // Addressing follows the config...
        assert_eq!(devices[0].name, "Tank 1");
        assert_eq!(devices[0].host, "192.168.1.40");
        // ...but the bookkeeping survives.
        assert_eq!(devices[0].total_uv_secs, 3600);
        assert_eq!(devices[0].uv_session_start, Some(1000));
    }
}
