use crate::engine::{EngineError, EngineHandle};
use vigil_core::gesture::GestureKind;
use vigil_core::{Command, CommandError, FrameObservation, OrientationSample, SessionError, SystemStatus};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

/// D-Bus interface for the Vigil presence daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    engine: EngineHandle,
}

impl VigilService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    async fn run(&self, command: Command) -> zbus::fdo::Result<()> {
        self.engine.execute(command).await.map_err(to_fdo)
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Feed one recognition verdict, as JSON.
    async fn submit_observation(&self, observation: &str) -> zbus::fdo::Result<()> {
        let observation: FrameObservation = serde_json::from_str(observation)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad observation: {e}")))?;
        self.engine.observe(observation).await.map_err(to_fdo)
    }

    /// Report the session lock and sleep flags.
    async fn set_system_state(&self, locked: bool, sleeping: bool) -> zbus::fdo::Result<()> {
        tracing::info!(locked, sleeping, "system state reported");
        self.engine
            .system_status(SystemStatus { locked, sleeping })
            .await
            .map_err(to_fdo)
    }

    /// The screen was unlocked by the user.
    async fn unlocked(&self) -> zbus::fdo::Result<()> {
        self.engine.unlocked().await.map_err(to_fdo)
    }

    async fn restore_now(&self) -> zbus::fdo::Result<()> {
        self.run(Command::RestoreNow).await
    }

    async fn start_trusted_session(&self, user: &str, key: &str) -> zbus::fdo::Result<()> {
        tracing::info!(user, "trusted session requested");
        self.run(Command::StartTrustedSession {
            key: key.to_string(),
            user: user.to_string(),
        })
        .await
    }

    async fn end_trusted_session(&self) -> zbus::fdo::Result<()> {
        self.run(Command::EndTrustedSession).await
    }

    async fn set_key(&self, key: &str, timeout_minutes: u32) -> zbus::fdo::Result<()> {
        self.run(Command::SetKey {
            secret: key.to_string(),
            timeout_minutes,
        })
        .await
    }

    async fn clear_key(&self) -> zbus::fdo::Result<()> {
        self.run(Command::ClearKey).await
    }

    /// Derive thresholds from a JSON array of rest-pose orientation samples.
    async fn calibrate(&self, samples: &str) -> zbus::fdo::Result<()> {
        let samples: Vec<OrientationSample> = serde_json::from_str(samples)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad samples: {e}")))?;
        self.run(Command::Calibrate(samples)).await
    }

    /// Start interactive training of `nod` or `shake`.
    async fn train(&self, kind: &str, repetitions: u32) -> zbus::fdo::Result<()> {
        self.run(Command::Train {
            kind: gesture_kind(kind)?,
            repetitions: repetitions as usize,
        })
        .await
    }

    /// Watch ten seconds for one `nod` or `shake`; the verdict arrives as an
    /// `Action` notification.
    async fn test_gesture(&self, kind: &str) -> zbus::fdo::Result<()> {
        self.run(Command::TestGesture(gesture_kind(kind)?)).await
    }

    async fn set_absence_delay(&self, seconds: u64) -> zbus::fdo::Result<()> {
        self.run(Command::SetAbsenceDelay(seconds)).await
    }

    async fn set_lock_grace_period(&self, seconds: u64) -> zbus::fdo::Result<()> {
        self.run(Command::SetLockGracePeriod(seconds)).await
    }

    async fn set_auto_lock_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        self.run(Command::SetAutoLockEnabled(enabled)).await
    }

    /// Return machine status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "machine": status,
        })
        .to_string())
    }

    /// Most recent session audit entries as a JSON array, newest first.
    async fn audit_log(&self, limit: u32) -> zbus::fdo::Result<String> {
        let entries = self.engine.audit_log(limit).await.map_err(to_fdo)?;
        serde_json::to_string(&entries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// One emitted action intent, as JSON.
    #[zbus(signal)]
    pub async fn action(emitter: &SignalEmitter<'_>, intent: &str) -> zbus::Result<()>;
}

fn gesture_kind(kind: &str) -> zbus::fdo::Result<GestureKind> {
    kind.parse().map_err(zbus::fdo::Error::InvalidArgs)
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    match err {
        EngineError::Command(CommandError::Session(e @ SessionError::InvalidKey { .. })) => {
            Error::AccessDenied(e.to_string())
        }
        EngineError::Command(e @ CommandError::Session(SessionError::Hashing(_))) => {
            Error::Failed(e.to_string())
        }
        EngineError::Command(
            e @ (CommandError::Session(_) | CommandError::Gesture(_)),
        ) => Error::InvalidArgs(e.to_string()),
        EngineError::Command(e @ (CommandError::Paused | CommandError::GesturePending)) => {
            Error::Failed(e.to_string())
        }
        e @ (EngineError::Store(_) | EngineError::ChannelClosed) => Error::Failed(e.to_string()),
    }
}
