use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::Weekday;

use crate::device::{Device, PowerState};
use crate::timecalc::weekday_from_abbrev;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A user-defined weekly UV cleaning recurrence.  The id stays stable
/// across edits; tasks queued on its behalf carry it as cancellation tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub device_id: String,
    pub name: String,
    /// Weekday abbreviations ("Mon".."Sun"); non-empty while active.
    pub days: Vec<String>,
    /// "HH:MM", 24-hour wall clock.
    #[serde(rename = "time")]
    pub time_of_day: String,
    pub duration_min: i64,
    pub active: bool,
}

impl Schedule {
    /// Resolved weekday set; unknown abbreviations are dropped.
    pub fn weekdays(&self) -> Vec<Weekday> {
        self.days
            .iter()
            .filter_map(|d| weekday_from_abbrev(d))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub ts: i64,
    pub device_id: Option<String>,
    pub schedule_id: Option<String>,
    pub kind: String,
    pub detail: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/uvclean/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn upsert_schedule(&self, s: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
              schedule_id, device_id, name, days, time_of_day, duration_min, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(schedule_id) DO UPDATE SET
              device_id=excluded.device_id,
              name=excluded.name,
              days=excluded.days,
              time_of_day=excluded.time_of_day,
              duration_min=excluded.duration_min,
              active=excluded.active
            "#,
        )
        .bind(&s.schedule_id)
        .bind(&s.device_id)
        .bind(&s.name)
        .bind(s.days.join(","))
        .bind(&s.time_of_day)
        .bind(s.duration_min)
        .bind(s.active)
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"
            SELECT schedule_id, device_id, name, days, time_of_day, duration_min, active
            FROM schedules
            WHERE schedule_id = ?
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")?;

        Ok(row.map(|r| schedule_from_row(&r)))
    }

    pub async fn load_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT schedule_id, device_id, name, days, time_of_day, duration_min, active
            FROM schedules
            ORDER BY schedule_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_schedules failed")?;

        Ok(rows.iter().map(schedule_from_row).collect())
    }

    pub async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT schedule_id, device_id, name, days, time_of_day, duration_min, active
            FROM schedules
            WHERE active = 1
            ORDER BY schedule_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list_active_schedules failed")?;

        Ok(rows.iter().map(schedule_from_row).collect())
    }

    pub async fn set_schedule_active(&self, schedule_id: &str, active: bool) -> Result<bool> {
        let res = sqlx::query("UPDATE schedules SET active = ? WHERE schedule_id = ?")
            .bind(active)
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .context("set_schedule_active failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM schedules WHERE schedule_id = ?")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(&self, d: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, name, host, port, power,
              uv_session_start, uv_session_end, total_uv_sec,
              last_seen, temperature, ph, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              name=excluded.name,
              host=excluded.host,
              port=excluded.port,
              power=excluded.power,
              uv_session_start=excluded.uv_session_start,
              uv_session_end=excluded.uv_session_end,
              total_uv_sec=excluded.total_uv_sec,
              last_seen=excluded.last_seen,
              temperature=excluded.temperature,
              ph=excluded.ph,
              version=excluded.version
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.name)
        .bind(&d.host)
        .bind(d.port as i64)
        .bind(d.power.as_db_str())
        .bind(d.uv_session_start)
        .bind(d.uv_session_end)
        .bind(d.total_uv_secs)
        .bind(d.last_seen)
        .bind(d.temperature)
        .bind(d.ph)
        .bind(&d.version)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, name, host, port, power,
                   uv_session_start, uv_session_end, total_uv_sec,
                   last_seen, temperature, ph, version
            FROM devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")?;

        Ok(rows.iter().map(device_from_row).collect())
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("delete_device failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Activity log
    // ----------------------------

    pub async fn insert_activity(
        &self,
        ts: i64,
        device_id: Option<&str>,
        schedule_id: Option<&str>,
        kind: &str,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (ts, device_id, schedule_id, kind, detail)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(device_id)
        .bind(schedule_id)
        .bind(kind)
        .bind(detail)
        .execute(&self.pool)
        .await
        .context("insert_activity failed")?;
        Ok(())
    }

    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, device_id, schedule_id, kind, detail
            FROM activity_log
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_activity failed")?;

        Ok(rows
            .iter()
            .map(|r| ActivityEntry {
                ts: r.get("ts"),
                device_id: r.get("device_id"),
                schedule_id: r.get("schedule_id"),
                kind: r.get("kind"),
                detail: r.get("detail"),
            })
            .collect())
    }
}

fn schedule_from_row(r: &SqliteRow) -> Schedule {
    let days: String = r.get("days");
    Schedule {
        schedule_id: r.get("schedule_id"),
        device_id: r.get("device_id"),
        name: r.get("name"),
        days: days
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        time_of_day: r.get("time_of_day"),
        duration_min: r.get("duration_min"),
        active: r.get("active"),
    }
}

fn device_from_row(r: &SqliteRow) -> Device {
    let power: String = r.get("power");
    Device {
        device_id: r.get("device_id"),
        name: r.get("name"),
        host: r.get("host"),
        port: r.get::<i64, _>("port") as u16,
        power: PowerState::from_db_str(&power),
        uv_session_start: r.get("uv_session_start"),
        uv_session_end: r.get("uv_session_end"),
        total_uv_secs: r.get("total_uv_sec"),
        last_seen: r.get("last_seen"),
        temperature: r.get("temperature"),
        ph: r.get("ph"),
        version: r.get("version"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
