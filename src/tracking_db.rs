//! Durable work-tracking store: the activity table and the counter table that
//! coordinates stage transitions.
//!
//! The counter update is an atomic add-and-return; the first completer whose
//! increment lands exactly on the expected total fires the next stage, every
//! other completer observes a different count and stays silent.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::models::{Activity, ActivityStatus};

#[derive(Debug, Clone)]
pub struct ControlRow {
    pub id: String,
    pub mycount: i64,
    pub total: i64,
    pub end_date: Option<String>,
    pub errors: i64,
}

#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub id: String,
    pub sk: String,
    pub status: ActivityStatus,
    pub efficacy: f64,
    pub cloudratio: f64,
    pub instances: i64,
    pub activity: Activity,
}

pub struct TrackingDb {
    conn: Mutex<Connection>,
}

impl TrackingDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS activities (
                id         TEXT NOT NULL,
                sk         TEXT NOT NULL,
                status     TEXT NOT NULL CHECK(status IN ('NOTDONE','DONE','ERROR')),
                efficacy   REAL NOT NULL DEFAULT 0,
                cloudratio REAL NOT NULL DEFAULT 100,
                instances  INTEGER NOT NULL DEFAULT 0,
                activity   TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                PRIMARY KEY (id, sk)
            );

            CREATE TABLE IF NOT EXISTS control (
                id       TEXT PRIMARY KEY,
                mycount  INTEGER NOT NULL DEFAULT 0,
                total    INTEGER NOT NULL,
                end_date TEXT,
                errors   INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    /// Cheap reachability probe for the readiness endpoint.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM control", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ── Activity table ──

    pub fn put_activity(&self, activity: &Activity) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(activity)?;
        conn.execute(
            "INSERT INTO activities (id, sk, status, efficacy, cloudratio, instances, activity) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(id, sk) DO UPDATE SET status = ?3, efficacy = ?4, cloudratio = ?5, \
             instances = ?6, activity = ?7, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![
                activity.dynamo_key,
                activity.sk,
                activity.mystatus.as_str(),
                activity.efficacy,
                activity.cloudratio,
                activity.instances() as i64,
                json,
            ],
        )?;
        Ok(())
    }

    pub fn get_activity(&self, id: &str, sk: &str) -> anyhow::Result<Option<ActivityRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, sk, status, efficacy, cloudratio, instances, activity \
             FROM activities WHERE id = ?1 AND sk = ?2",
        )?;
        let row = stmt
            .query_row(params![id, sk], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;
        row.map(Self::decode_row).transpose()
    }

    pub fn activities_by_key(&self, id: &str) -> anyhow::Result<Vec<ActivityRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, sk, status, efficacy, cloudratio, instances, activity \
             FROM activities WHERE id = ?1 ORDER BY sk ASC",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_row).collect()
    }

    pub fn remove_activity(&self, id: &str, sk: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM activities WHERE id = ?1 AND sk = ?2", params![id, sk])?;
        Ok(())
    }

    /// Remove every activity row under a dynamo key (force path).
    pub fn remove_activities_by_key(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM activities WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn decode_row(
        (id, sk, status, efficacy, cloudratio, instances, json): (
            String,
            String,
            String,
            f64,
            f64,
            i64,
            String,
        ),
    ) -> anyhow::Result<ActivityRow> {
        let status = match status.as_str() {
            "DONE" => ActivityStatus::Done,
            "ERROR" => ActivityStatus::Error,
            _ => ActivityStatus::NotDone,
        };
        Ok(ActivityRow {
            id,
            sk,
            status,
            efficacy,
            cloudratio,
            instances,
            activity: serde_json::from_str(&json)?,
        })
    }

    // ── Counter table ──

    /// Register a stage's expected completion count, resetting any prior row.
    pub fn put_control(&self, id: &str, count: i64, total: i64, date: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO control (id, mycount, total, end_date) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET mycount = ?2, total = ?3, end_date = ?4, errors = 0",
            params![id, count, total, date],
        )?;
        Ok(())
    }

    /// Atomic add-and-return of the completion counter. Returns the new count
    /// together with the expected total, or `None` when no row exists for the
    /// key.
    pub fn increment_count(&self, id: &str, date: &str) -> anyhow::Result<Option<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "UPDATE control SET mycount = mycount + 1, end_date = ?2 WHERE id = ?1 \
                 RETURNING mycount, total",
                params![id, date],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn increment_errors(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE control SET errors = errors + 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_control(&self, id: &str) -> anyhow::Result<Option<ControlRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, mycount, total, end_date, errors FROM control WHERE id = ?1")?;
        let row = stmt
            .query_row(params![id], |row| {
                Ok(ControlRow {
                    id: row.get(0)?,
                    mycount: row.get(1)?,
                    total: row.get(2)?,
                    end_date: row.get(3)?,
                    errors: row.get(4)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn remove_control(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM control WHERE id = ?1", params![id])?;
        Ok(())
    }
}
