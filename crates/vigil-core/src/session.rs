//! Trusted sessions: time-boxed, key-authenticated suppression of
//! unknown-face alerts.
//!
//! Only an Argon2id PHC string of the key is kept. An active session's
//! remaining time is always derived from `started_at`, never stored.

use crate::types::Timestamp;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_TIMEOUT_MINUTES: u32 = 120;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("trusted sessions are not configured: no key set")]
    NotConfigured,
    #[error("invalid key ({attempts} failed attempts)")]
    InvalidKey { attempts: u32 },
    #[error("key must not be empty")]
    EmptyKey,
    #[error("no trusted session is active")]
    NoActiveSession,
    #[error("key hashing failed: {0}")]
    Hashing(String),
}

/// Persisted key configuration. Never holds the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    /// PHC string; carries algorithm, parameters and salt.
    pub hash: String,
    pub timeout_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySession {
    pub id: String,
    pub active: bool,
    pub user_name: String,
    pub started_at: Timestamp,
    pub timeout_seconds: i64,
}

impl SecuritySession {
    pub fn remaining(&self, now: Timestamp) -> Duration {
        let left = Duration::seconds(self.timeout_seconds) - (now - self.started_at);
        left.max(Duration::zero())
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now - self.started_at >= Duration::seconds(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub configured: bool,
    pub active: bool,
    pub user: Option<String>,
    pub remaining_seconds: i64,
    pub timeout_minutes: u32,
    pub failed_attempts: u32,
}

#[derive(Default)]
pub struct TrustedSessionManager {
    key: Option<SessionKey>,
    session: Option<SecuritySession>,
    failed_attempts: u32,
}

impl TrustedSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Store an Argon2 hash of `secret`; the timeout is clamped to 1–120 minutes.
    pub fn set_key(&mut self, secret: &str, timeout_minutes: u32) -> Result<(), SessionError> {
        if secret.is_empty() {
            return Err(SessionError::EmptyKey);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| SessionError::Hashing(e.to_string()))?
            .to_string();
        let timeout_minutes = timeout_minutes.clamp(MIN_TIMEOUT_MINUTES, MAX_TIMEOUT_MINUTES);
        self.key = Some(SessionKey {
            hash,
            timeout_minutes,
        });
        self.failed_attempts = 0;
        tracing::info!(timeout_minutes, "trusted session key set");
        Ok(())
    }

    /// Remove the key and end any active session.
    pub fn clear_key(&mut self) -> Option<SecuritySession> {
        self.key = None;
        self.failed_attempts = 0;
        self.session.take()
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let Some(key) = &self.key else {
            return false;
        };
        let parsed = match PasswordHash::new(&key.hash) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "stored key hash is corrupt");
                return false;
            }
        };
        Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok()
    }

    /// Verify `candidate` and open a session for `user_name`, replacing any
    /// session already active.
    pub fn start(
        &mut self,
        user_name: &str,
        candidate: &str,
        now: Timestamp,
    ) -> Result<SecuritySession, SessionError> {
        let Some(key) = &self.key else {
            return Err(SessionError::NotConfigured);
        };
        let timeout_seconds = i64::from(key.timeout_minutes) * 60;

        if !self.verify(candidate) {
            self.failed_attempts += 1;
            tracing::warn!(attempts = self.failed_attempts, "trusted session key rejected");
            return Err(SessionError::InvalidKey {
                attempts: self.failed_attempts,
            });
        }

        if let Some(prev) = &self.session {
            tracing::info!(user = %prev.user_name, "replacing active trusted session");
        }
        let session = SecuritySession {
            id: uuid::Uuid::new_v4().to_string(),
            active: true,
            user_name: user_name.to_string(),
            started_at: now,
            timeout_seconds,
        };
        self.failed_attempts = 0;
        self.session = Some(session.clone());
        tracing::info!(user = user_name, timeout_seconds, "trusted session started");
        Ok(session)
    }

    pub fn end(&mut self) -> Result<SecuritySession, SessionError> {
        let mut session = self.session.take().ok_or(SessionError::NoActiveSession)?;
        session.active = false;
        tracing::info!(user = %session.user_name, "trusted session ended");
        Ok(session)
    }

    /// End the session if its timeout has elapsed at `now`.
    pub fn poll(&mut self, now: Timestamp) -> Option<SecuritySession> {
        if !self.session.as_ref()?.is_expired(now) {
            return None;
        }
        let mut session = self.session.take()?;
        session.active = false;
        tracing::info!(user = %session.user_name, "trusted session expired");
        Some(session)
    }

    pub fn active(&self) -> Option<&SecuritySession> {
        self.session.as_ref()
    }

    pub fn status(&self, now: Timestamp) -> SessionStatus {
        SessionStatus {
            configured: self.key.is_some(),
            active: self.session.is_some(),
            user: self.session.as_ref().map(|s| s.user_name.clone()),
            remaining_seconds: self
                .session
                .as_ref()
                .map(|s| s.remaining(now).num_seconds())
                .unwrap_or(0),
            timeout_minutes: self.key.as_ref().map(|k| k.timeout_minutes).unwrap_or(0),
            failed_attempts: self.failed_attempts,
        }
    }

    // Persistence accessors.

    pub fn key_config(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub fn set_key_config(&mut self, key: Option<SessionKey>) {
        self.key = key;
    }

    pub fn session_runtime(&self) -> Option<&SecuritySession> {
        self.session.as_ref()
    }

    /// Reinstate a persisted session. Inactive sessions are discarded.
    pub fn restore_session(&mut self, session: Option<SecuritySession>) {
        self.session = session.filter(|s| s.active);
    }
}
