use crate::store::{AuditEntry, Store, StoreError};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::{
    ActionIntent, Command, CommandError, FrameObservation, MachineStatus, SecurityStateMachine,
    SystemStatus, Timestamp,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers and the tick task to the engine thread.
enum EngineRequest {
    Tick,
    Observe {
        observation: FrameObservation,
        reply: oneshot::Sender<()>,
    },
    SystemStatus {
        status: SystemStatus,
        reply: oneshot::Sender<()>,
    },
    Unlocked {
        reply: oneshot::Sender<()>,
    },
    Command {
        command: Command,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Status {
        reply: oneshot::Sender<MachineStatus>,
    },
    AuditLog {
        limit: u32,
        reply: oneshot::Sender<Result<Vec<AuditEntry>, StoreError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Advance deadlines with the wall clock. Does not wait for the result.
    pub async fn tick(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Tick)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn observe(&self, observation: FrameObservation) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Observe { observation, reply })
            .await
    }

    pub async fn system_status(&self, status: SystemStatus) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SystemStatus { status, reply })
            .await
    }

    pub async fn unlocked(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Unlocked { reply }).await
    }

    pub async fn execute(&self, command: Command) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Command { command, reply })
            .await??;
        Ok(())
    }

    pub async fn status(&self) -> Result<MachineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::AuditLog { limit, reply })
            .await??)
    }
}

/// Owns the machine and the store on the engine thread.
struct Engine {
    machine: SecurityStateMachine,
    store: Store,
    intents: mpsc::UnboundedSender<ActionIntent>,
    saved_revision: u64,
}

impl Engine {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Tick => {
                let now = Utc::now();
                let out = self.machine.tick(now, None);
                self.after(now, out);
            }
            EngineRequest::Observe { observation, reply } => {
                let now = observation.timestamp;
                let out = self.machine.tick(now, Some(&observation));
                self.after(now, out);
                let _ = reply.send(());
            }
            EngineRequest::SystemStatus { status, reply } => {
                let now = Utc::now();
                let out = self.machine.system_status(now, status);
                self.after(now, out);
                let _ = reply.send(());
            }
            EngineRequest::Unlocked { reply } => {
                let now = Utc::now();
                let out = self.machine.unlocked(now);
                self.after(now, out);
                let _ = reply.send(());
            }
            EngineRequest::Command { command, reply } => {
                let now = Utc::now();
                let name = command.name();
                let result = match self.machine.execute(now, command) {
                    Ok(out) => {
                        self.after(now, out);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(command = name, error = %e, "command rejected");
                        // Rejections still produce audit rows.
                        self.after(now, Vec::new());
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.machine.status(Utc::now()));
            }
            EngineRequest::AuditLog { limit, reply } => {
                let _ = reply.send(self.store.audit_log(limit));
            }
        }
    }

    /// Publish intents, record session events and persist changed state.
    fn after(&mut self, now: Timestamp, intents: Vec<ActionIntent>) {
        for intent in intents {
            tracing::debug!(intent = %intent.to_json(), "action intent");
            if self.intents.send(intent).is_err() {
                tracing::warn!("intent receiver dropped");
            }
        }

        for event in self.machine.take_session_events() {
            if let Err(e) = self.store.record_session_event(&event) {
                tracing::error!(error = %e, "failed to record session event");
            }
        }

        let revision = self.machine.revision();
        if revision != self.saved_revision {
            match self.store.save_state(&self.machine.persisted(), now) {
                Ok(()) => self.saved_revision = revision,
                Err(e) => tracing::error!(error = %e, "failed to persist state"),
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The machine is expected to be restored already; its current revision is
/// taken as saved.
pub fn spawn_engine(
    machine: SecurityStateMachine,
    store: Store,
    intents: mpsc::UnboundedSender<ActionIntent>,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(32);
    let mut engine = Engine {
        saved_revision: machine.revision(),
        machine,
        store,
        intents,
    };

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            tracing::info!(state = %engine.machine.state(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::machine::MachineSettings;
    use vigil_core::{ActionKind, SecurityState};

    fn start() -> (EngineHandle, mpsc::UnboundedReceiver<ActionIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_engine(
            SecurityStateMachine::new(MachineSettings::default()),
            Store::open_in_memory().unwrap(),
            tx,
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn test_status_reports_initial_state() {
        let (engine, _rx) = start();
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, SecurityState::OwnerPresent);
        assert!(!status.session.configured);
    }

    #[tokio::test]
    async fn test_unknown_face_requests_capture() {
        let (engine, mut rx) = start();
        engine
            .observe(FrameObservation::unknown(Utc::now()))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(intent) = rx.try_recv() {
            kinds.push(intent.kind);
        }
        assert!(kinds.contains(&ActionKind::CaptureUnknownFace));
        assert_eq!(
            engine.status().await.unwrap().state,
            SecurityState::UnknownPendingGesture
        );
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_and_audited() {
        let (engine, _rx) = start();
        engine
            .execute(Command::SetKey {
                secret: "open sesame".into(),
                timeout_minutes: 10,
            })
            .await
            .unwrap();

        let err = engine
            .execute(Command::StartTrustedSession {
                key: "wrong".into(),
                user: "alice".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Command(CommandError::Session(vigil_core::SessionError::InvalidKey { .. }))
        ));

        let log = engine.audit_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event, "rejected");
    }

    #[tokio::test]
    async fn test_session_lifecycle_audited() {
        let (engine, _rx) = start();
        engine
            .execute(Command::SetKey {
                secret: "open sesame".into(),
                timeout_minutes: 10,
            })
            .await
            .unwrap();
        engine
            .execute(Command::StartTrustedSession {
                key: "open sesame".into(),
                user: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            engine.status().await.unwrap().state,
            SecurityState::TrustedSessionActive
        );
        engine.execute(Command::EndTrustedSession).await.unwrap();

        let events: Vec<String> = engine
            .audit_log(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["ended", "started"]);
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ActionIntent>) -> Vec<ActionKind> {
        let mut kinds = Vec::new();
        while let Ok(intent) = rx.try_recv() {
            kinds.push(intent.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_ticks_and_observations_processed_in_order() {
        let (engine, mut rx) = start();
        engine.observe(FrameObservation::owner(Utc::now())).await.unwrap();
        for _ in 0..3 {
            engine.tick().await.unwrap();
        }
        // The reply only arrives once the queued ticks ahead of it were handled.
        engine
            .observe(FrameObservation::unknown(Utc::now()))
            .await
            .unwrap();

        let kinds = drain(&mut rx);
        assert_eq!(kinds.first(), Some(&ActionKind::CaptureUnknownFace));
        assert_eq!(kinds.len(), 2);

        engine.tick().await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, SecurityState::UnknownPendingGesture);
        assert!(status.deadline_in_ms.is_some());
    }

    #[tokio::test]
    async fn test_gesture_test_reported_in_status() {
        let (engine, mut rx) = start();
        engine
            .execute(Command::TestGesture(vigil_core::GestureKind::Nod))
            .await
            .unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.gesture_test, Some(vigil_core::GestureKind::Nod));
        assert!(matches!(drain(&mut rx).as_slice(), [ActionKind::Notify { .. }]));
        assert!(engine.audit_log(10).await.unwrap().is_empty());
    }
}
