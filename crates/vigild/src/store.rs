//! SQLite persistence for thresholds, templates, key configuration, session
//! runtime and the session audit trail.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use vigil_core::machine::SessionEndReason;
use vigil_core::{MachineSettings, PersistedState, SessionEvent};

const KEY_SETTINGS: &str = "machine_settings";
const KEY_THRESHOLDS: &str = "gesture_thresholds";
const KEY_TEMPLATES: &str = "gesture_templates";
const KEY_SESSION_KEY: &str = "session_key";
const KEY_SESSION: &str = "session_runtime";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("corrupt value for {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the session audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: String,
    pub session_id: Option<String>,
    pub user_name: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn };
        store.init_schema()?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS session_audit (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                event      TEXT NOT NULL,
                session_id TEXT,
                user_name  TEXT,
                detail     TEXT,
                at         TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|v| {
            serde_json::from_str(&v).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn put<T: Serialize>(conn: &Connection, key: &str, value: &T, now: DateTime<Utc>) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load the persisted machine structures, or `None` on first run.
    pub fn load_state(&self) -> Result<Option<PersistedState>, StoreError> {
        let settings: Option<MachineSettings> = self.get(KEY_SETTINGS)?;
        let Some(settings) = settings else {
            return Ok(None);
        };
        Ok(Some(PersistedState {
            settings,
            thresholds: self.get(KEY_THRESHOLDS)?.unwrap_or_default(),
            trained: self.get(KEY_TEMPLATES)?.unwrap_or_default(),
            session_key: self.get::<Option<_>>(KEY_SESSION_KEY)?.flatten(),
            session: self.get::<Option<_>>(KEY_SESSION)?.flatten(),
        }))
    }

    /// Save every persisted structure in one transaction.
    pub fn save_state(&mut self, state: &PersistedState, now: DateTime<Utc>) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        Self::put(&tx, KEY_SETTINGS, &state.settings, now)?;
        Self::put(&tx, KEY_THRESHOLDS, &state.thresholds, now)?;
        Self::put(&tx, KEY_TEMPLATES, &state.trained, now)?;
        Self::put(&tx, KEY_SESSION_KEY, &state.session_key, now)?;
        Self::put(&tx, KEY_SESSION, &state.session, now)?;
        tx.commit()?;
        tracing::debug!("state saved");
        Ok(())
    }

    pub fn record_session_event(&self, event: &SessionEvent) -> Result<(), StoreError> {
        let (name, session_id, user, detail, at) = match event {
            SessionEvent::Started { id, user, at } => ("started", Some(id.as_str()), Some(user.as_str()), None, at),
            SessionEvent::Ended {
                id,
                user,
                at,
                reason,
            } => (
                "ended",
                Some(id.as_str()),
                Some(user.as_str()),
                Some(reason_detail(*reason)),
                at,
            ),
            SessionEvent::Rejected { attempts, at } => {
                ("rejected", None, None, Some(format!("attempt {attempts}")), at)
            }
        };
        self.conn.execute(
            "INSERT INTO session_audit (event, session_id, user_name, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, session_id, user, detail, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event, session_id, user_name, detail, at FROM session_audit
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let at: String = row.get(4)?;
            let at = DateTime::parse_from_rfc3339(&at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?;
            Ok(AuditEntry {
                event: row.get(0)?,
                session_id: row.get(1)?,
                user_name: row.get(2)?,
                detail: row.get(3)?,
                at,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn reason_detail(reason: SessionEndReason) -> String {
    reason.as_str().to_string()
}

/// Overlay the settings commands can change at runtime onto the configured
/// ones.
pub fn merge_settings(configured: MachineSettings, persisted: &MachineSettings) -> MachineSettings {
    MachineSettings {
        absence_delay_secs: persisted.absence_delay_secs,
        lock_grace_period_secs: persisted.lock_grace_period_secs,
        auto_lock_enabled: persisted.auto_lock_enabled,
        ..configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vigil_core::session::SecuritySession;
    use vigil_core::GestureThresholds;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_first_run_is_empty() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_state().unwrap().is_none());
        assert!(store.audit_log(10).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_state() {
        let mut store = Store::open_in_memory().unwrap();
        let state = PersistedState {
            settings: MachineSettings {
                absence_delay_secs: 25,
                ..MachineSettings::default()
            },
            thresholds: GestureThresholds {
                pitch_amplitude: 7.5,
                baseline_pitch: 3.0,
                ..GestureThresholds::default()
            },
            session: Some(SecuritySession {
                id: "abc".into(),
                active: true,
                user_name: "alice".into(),
                started_at: t0(),
                timeout_seconds: 600,
            }),
            ..PersistedState::default()
        };
        store.save_state(&state, t0()).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(state.clone()));

        // Overwrite, not append.
        let mut next = state;
        next.session = None;
        store.save_state(&next, t0()).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(next));
    }

    #[test]
    fn test_corrupt_value_reported() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![KEY_SETTINGS, "{not json", t0().to_rfc3339()],
            )
            .unwrap();
        assert!(matches!(store.load_state(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_audit_log_newest_first() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_session_event(&SessionEvent::Rejected { attempts: 1, at: t0() })
            .unwrap();
        store
            .record_session_event(&SessionEvent::Started {
                id: "s1".into(),
                user: "alice".into(),
                at: t0() + Duration::seconds(5),
            })
            .unwrap();
        store
            .record_session_event(&SessionEvent::Ended {
                id: "s1".into(),
                user: "alice".into(),
                at: t0() + Duration::seconds(65),
                reason: SessionEndReason::Expired,
            })
            .unwrap();

        let log = store.audit_log(10).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].event, "ended");
        assert_eq!(log[0].detail.as_deref(), Some("expired"));
        assert_eq!(log[1].user_name.as_deref(), Some("alice"));
        assert_eq!(log[2].event, "rejected");
        assert_eq!(log[2].session_id, None);
        assert_eq!(log[2].at, t0());

        assert_eq!(store.audit_log(1).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_settings_keeps_configured_timing() {
        let configured = MachineSettings {
            sensor_gap_ms: 500,
            ..MachineSettings::default()
        };
        let persisted = MachineSettings {
            absence_delay_secs: 45,
            auto_lock_enabled: false,
            sensor_gap_ms: 9000,
            ..MachineSettings::default()
        };
        let merged = merge_settings(configured, &persisted);
        assert_eq!(merged.absence_delay_secs, 45);
        assert!(!merged.auto_lock_enabled);
        assert_eq!(merged.sensor_gap_ms, 500);
    }
}
