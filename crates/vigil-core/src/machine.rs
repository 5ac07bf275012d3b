//! The security state machine.
//!
//! One instance owns the machine state, the single pending deadline and the
//! display state, and is the only producer of dim/lock/restore intents. All
//! mutation goes through [`SecurityStateMachine::tick`],
//! [`SecurityStateMachine::system_status`], [`SecurityStateMachine::unlocked`]
//! and [`SecurityStateMachine::execute`], each taking an injected `now`.
//!
//! Within a tick, events derived from the observation are applied first and
//! expired deadlines second. The one exception is a gesture window that had
//! already closed when the frame was captured: it expires before the frame
//! is routed, so a late nod never counts.

use crate::gesture::{
    CaptureProgress, Evaluation, GestureConfig, GestureError, GestureKind, GestureRecognizer,
    GestureThresholds, OrientationSample, TrainedGestures, TrainingCapture,
};
use crate::pose;
use crate::presence::{PresenceChange, PresenceConfig, PresenceState, PresenceTracker};
use crate::session::{SecuritySession, SessionError, SessionKey, SessionStatus, TrustedSessionManager};
use crate::types::{ActionIntent, ActionKind, FrameObservation, Severity, SystemStatus, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ABSENCE_DELAY_RANGE: (u64, u64) = (1, 60);
pub const LOCK_GRACE_RANGE: (u64, u64) = (5, 300);
pub const GESTURE_TIMEOUT_RANGE: (u64, u64) = (1, 60);
pub const SENSOR_GAP_RANGE_MS: (u64, u64) = (100, 60_000);
pub const TRAINING_REPETITIONS_RANGE: (usize, usize) = (3, 20);
pub const DEFAULT_TRAINING_REPETITIONS: usize = 5;

const CAPTURE_INTERVAL_SECS: i64 = 5;
const UNKNOWN_REARM_SECS: i64 = 5;
const TRAINING_TIMEOUT_SECS: i64 = 30;
const GESTURE_TEST_SECS: i64 = 10;
/// Upper bound on deadline cascades within one tick (pending-dim → dimmed → …).
const MAX_DEADLINE_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityState {
    OwnerPresent,
    OwnerAbsentPendingDim,
    Dimmed,
    LockGracePeriod,
    Locked,
    UnknownPendingGesture,
    TrustedSessionActive,
    Paused,
}

impl SecurityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnerPresent => "owner_present",
            Self::OwnerAbsentPendingDim => "owner_absent_pending_dim",
            Self::Dimmed => "dimmed",
            Self::LockGracePeriod => "lock_grace_period",
            Self::Locked => "locked",
            Self::UnknownPendingGesture => "unknown_pending_gesture",
            Self::TrustedSessionActive => "trusted_session_active",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the machine last asked the display to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DisplayState {
    Normal,
    Dimmed { level: u8 },
    Locked,
}

/// Timing and policy knobs, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    pub absence_delay_secs: u64,
    /// Total time from dimming to lock.
    pub lock_grace_period_secs: u64,
    /// Tail of the grace period announced as a countdown.
    pub lock_warning_secs: u64,
    pub auto_lock_enabled: bool,
    pub gesture_timeout_secs: u64,
    pub sensor_gap_ms: u64,
    pub nod_dim_level: u8,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            absence_delay_secs: 10,
            lock_grace_period_secs: 40,
            lock_warning_secs: 10,
            auto_lock_enabled: true,
            gesture_timeout_secs: 6,
            sensor_gap_ms: 2000,
            nod_dim_level: 25,
        }
    }
}

impl MachineSettings {
    pub fn clamped(self) -> Self {
        Self {
            absence_delay_secs: self
                .absence_delay_secs
                .clamp(ABSENCE_DELAY_RANGE.0, ABSENCE_DELAY_RANGE.1),
            lock_grace_period_secs: self
                .lock_grace_period_secs
                .clamp(LOCK_GRACE_RANGE.0, LOCK_GRACE_RANGE.1),
            lock_warning_secs: self.lock_warning_secs.min(LOCK_GRACE_RANGE.1),
            gesture_timeout_secs: self
                .gesture_timeout_secs
                .clamp(GESTURE_TIMEOUT_RANGE.0, GESTURE_TIMEOUT_RANGE.1),
            sensor_gap_ms: self
                .sensor_gap_ms
                .clamp(SENSOR_GAP_RANGE_MS.0, SENSOR_GAP_RANGE_MS.1),
            nod_dim_level: self.nod_dim_level.min(100),
            ..self
        }
    }

    fn warning(&self) -> Duration {
        Duration::seconds(self.lock_warning_secs.min(self.lock_grace_period_secs) as i64)
    }

    fn dim_phase(&self) -> Duration {
        Duration::seconds(self.lock_grace_period_secs as i64) - self.warning()
    }

    fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            absence_delay: Duration::seconds(self.absence_delay_secs as i64),
            sensor_gap: Duration::milliseconds(self.sensor_gap_ms as i64),
        }
    }
}

/// Manual command surface.
#[derive(Clone, PartialEq)]
pub enum Command {
    RestoreNow,
    StartTrustedSession { key: String, user: String },
    EndTrustedSession,
    SetKey { secret: String, timeout_minutes: u32 },
    ClearKey,
    Calibrate(Vec<OrientationSample>),
    Train { kind: GestureKind, repetitions: usize },
    /// Watch for one gesture and report whether it was recognized.
    TestGesture(GestureKind),
    SetAbsenceDelay(u64),
    SetLockGracePeriod(u64),
    SetAutoLockEnabled(bool),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RestoreNow => "restore_now",
            Self::StartTrustedSession { .. } => "start_trusted_session",
            Self::EndTrustedSession => "end_trusted_session",
            Self::SetKey { .. } => "set_key",
            Self::ClearKey => "clear_key",
            Self::Calibrate(_) => "calibrate",
            Self::Train { .. } => "train",
            Self::TestGesture(_) => "test_gesture",
            Self::SetAbsenceDelay(_) => "set_absence_delay",
            Self::SetLockGracePeriod(_) => "set_lock_grace_period",
            Self::SetAutoLockEnabled(_) => "set_auto_lock_enabled",
        }
    }
}

// Keys must never reach a log line.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Gesture(#[from] GestureError),
    #[error("monitoring is paused")]
    Paused,
    #[error("a gesture confirmation is pending")]
    GesturePending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Explicit,
    Expired,
    Replaced,
    KeyCleared,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Expired => "expired",
            Self::Replaced => "replaced",
            Self::KeyCleared => "key_cleared",
        }
    }
}

/// Session bookkeeping for the audit trail, drained by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        id: String,
        user: String,
        at: Timestamp,
    },
    Ended {
        id: String,
        user: String,
        at: Timestamp,
        reason: SessionEndReason,
    },
    Rejected {
        attempts: u32,
        at: Timestamp,
    },
}

/// Everything the host persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub settings: MachineSettings,
    pub thresholds: GestureThresholds,
    pub trained: TrainedGestures,
    pub session_key: Option<SessionKey>,
    pub session: Option<SecuritySession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: SecurityState,
    pub display: DisplayState,
    pub presence: PresenceState,
    pub session: SessionStatus,
    pub settings: MachineSettings,
    pub deadline_in_ms: Option<i64>,
    pub training: Option<GestureKind>,
    pub gesture_test: Option<GestureKind>,
    pub system: SystemStatus,
}

/// State to return to after a pending confirmation or trusted session.
#[derive(Debug, Clone, Copy)]
struct Resume {
    state: SecurityState,
    display: DisplayState,
    /// Unexpired part of the suspended state's deadline.
    remaining: Option<Duration>,
}

impl Resume {
    fn owner_present() -> Self {
        Self {
            state: SecurityState::OwnerPresent,
            display: DisplayState::Normal,
            remaining: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GestureTest {
    kind: GestureKind,
    deadline: Timestamp,
}

fn intent(kind: ActionKind, now: Timestamp) -> ActionIntent {
    ActionIntent::new(kind, now)
}

fn notify(message: impl Into<String>, severity: Severity, now: Timestamp) -> ActionIntent {
    ActionIntent::notify(message, severity, now)
}

pub struct SecurityStateMachine {
    settings: MachineSettings,
    state: SecurityState,
    deadline: Option<Timestamp>,
    resume: Option<Resume>,
    display: DisplayState,
    presence: PresenceTracker,
    gestures: GestureRecognizer,
    sessions: TrustedSessionManager,
    system: SystemStatus,
    last_capture_at: Option<Timestamp>,
    rearm_at: Option<Timestamp>,
    training: Option<TrainingCapture>,
    gesture_test: Option<GestureTest>,
    session_events: Vec<SessionEvent>,
    /// Bumped whenever a persisted structure changes.
    revision: u64,
}

impl Default for SecurityStateMachine {
    fn default() -> Self {
        Self::new(MachineSettings::default())
    }
}

impl SecurityStateMachine {
    pub fn new(settings: MachineSettings) -> Self {
        let settings = settings.clamped();
        Self {
            presence: PresenceTracker::new(settings.presence_config()),
            settings,
            state: SecurityState::OwnerPresent,
            deadline: None,
            resume: None,
            display: DisplayState::Normal,
            gestures: GestureRecognizer::default(),
            sessions: TrustedSessionManager::new(),
            system: SystemStatus::default(),
            last_capture_at: None,
            rearm_at: None,
            training: None,
            gesture_test: None,
            session_events: Vec::new(),
            revision: 0,
        }
    }

    /// Replace the gesture tuning, keeping the current thresholds.
    pub fn with_gesture_config(mut self, config: GestureConfig) -> Self {
        self.gestures = GestureRecognizer::new(config, *self.gestures.thresholds());
        self
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    pub fn display(&self) -> DisplayState {
        self.display
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn gestures(&self) -> &GestureRecognizer {
        &self.gestures
    }

    pub fn sessions(&self) -> &TrustedSessionManager {
        &self.sessions
    }

    pub fn is_training(&self) -> bool {
        self.training.is_some()
    }

    pub fn take_session_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.session_events)
    }

    /// Changes whenever [`Self::persisted`] would return something new.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn status(&self, now: Timestamp) -> MachineStatus {
        MachineStatus {
            state: self.state,
            display: self.display,
            presence: self.presence.state(),
            session: self.sessions.status(now),
            settings: self.settings,
            deadline_in_ms: self.deadline.map(|d| (d - now).num_milliseconds().max(0)),
            training: self.training.as_ref().map(|t| t.kind),
            gesture_test: self.gesture_test.map(|t| t.kind),
            system: self.system,
        }
    }

    fn set_state(&mut self, to: SecurityState, reason: &'static str) {
        if self.state != to {
            tracing::info!(from = self.state.as_str(), to = to.as_str(), reason, "state transition");
        }
        self.state = to;
    }

    /// Advance the machine: apply the observation, if any, then any expired
    /// deadline.
    pub fn tick(&mut self, now: Timestamp, observation: Option<&FrameObservation>) -> Vec<ActionIntent> {
        let mut out = Vec::new();
        if self.state == SecurityState::Paused {
            if observation.is_some() {
                tracing::trace!("observation ignored while paused");
            }
            self.poll_session(now, &mut out);
            return out;
        }
        if let Some(obs) = observation {
            self.expire_before(obs, &mut out);
            self.apply_observation(obs, &mut out);
        }
        self.apply_deadlines(now, &mut out);
        out
    }

    /// Close gesture windows that ended before `obs` was captured. The owner
    /// in view still takes precedence over a pending confirmation.
    fn expire_before(&mut self, obs: &FrameObservation, out: &mut Vec<ActionIntent>) {
        let now = obs.timestamp;
        let pending_expired = self.state == SecurityState::UnknownPendingGesture
            && !obs.owner_matched
            && self.deadline.is_some_and(|d| d <= now);
        if pending_expired {
            self.deadline = None;
            self.gesture_timed_out(now, out);
        }
        self.expire_gesture_test(now, out);
    }

    fn apply_observation(&mut self, obs: &FrameObservation, out: &mut Vec<ActionIntent>) {
        let now = obs.timestamp;
        match self.presence.observe(obs) {
            PresenceChange::Departed => tracing::info!("owner departed"),
            PresenceChange::Returned => tracing::info!("owner back in view"),
            PresenceChange::None => {}
        }
        let gesture = self.orientation_step(obs, out);

        if let Some(name) = &obs.trusted_match_name {
            tracing::debug!(name = %name, "trusted face in view");
        }
        let unknown = obs.unknown_face_present && obs.trusted_match_name.is_none();

        match self.state {
            SecurityState::OwnerPresent => {
                if unknown && !obs.owner_matched {
                    self.arm_unknown(now, out);
                }
            }
            SecurityState::OwnerAbsentPendingDim => {
                if obs.owner_matched {
                    self.deadline = None;
                    self.set_state(SecurityState::OwnerPresent, "owner returned");
                }
            }
            SecurityState::Dimmed => {
                if obs.owner_matched {
                    self.owner_returned(now, out);
                } else if unknown {
                    self.arm_unknown(now, out);
                }
            }
            SecurityState::LockGracePeriod | SecurityState::Locked => {
                if obs.owner_matched {
                    self.owner_returned(now, out);
                }
            }
            SecurityState::UnknownPendingGesture => {
                if obs.owner_matched {
                    tracing::debug!("owner in view; pending confirmation void");
                    self.owner_returned(now, out);
                } else {
                    match gesture {
                        Some(GestureKind::Nod) => self.confirm_nod(now, out),
                        Some(GestureKind::Shake) => {
                            out.push(notify("Shake detected: cancelled", Severity::Info, now));
                            self.leave_pending(now, "shake");
                        }
                        None => {}
                    }
                }
            }
            SecurityState::TrustedSessionActive => {
                if obs.owner_matched {
                    self.resume = Some(Resume::owner_present());
                }
                if unknown {
                    tracing::info!("unknown face ignored during trusted session");
                }
            }
            SecurityState::Paused => {}
        }
        self.settle(now, out);
    }

    /// Derive an orientation sample and route it to training or gesture
    /// confirmation. Returns a confirmed gesture, if any.
    fn orientation_step(&mut self, obs: &FrameObservation, out: &mut Vec<ActionIntent>) -> Option<GestureKind> {
        let landmarks = obs.landmarks.as_ref()?;
        let orientation = match pose::estimate(landmarks) {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!(error = %e, "pose unavailable");
                return None;
            }
        };
        let sample = OrientationSample::new(obs.timestamp, orientation.pitch, orientation.yaw);

        if self.training.is_some() {
            self.feed_training(sample, out);
            return None;
        }
        if let Some(test) = self.gesture_test {
            if let Evaluation::Detected(d) = self.gestures.observe(sample) {
                self.finish_gesture_test(test.kind, d.kind, sample.timestamp, out);
            }
            return None;
        }
        if self.state != SecurityState::UnknownPendingGesture {
            return None;
        }
        match self.gestures.observe(sample) {
            Evaluation::Detected(d) => Some(d.kind),
            Evaluation::NoPattern | Evaluation::NotEnoughData => None,
        }
    }

    fn feed_training(&mut self, sample: OrientationSample, out: &mut Vec<ActionIntent>) {
        let now = sample.timestamp;
        let Some(capture) = self.training.as_mut() else {
            return;
        };
        match capture.push(sample) {
            CaptureProgress::Captured(n) => {
                let msg = format!("Repetition {n}/{} recorded", capture.target);
                out.push(notify(msg, Severity::Info, now));
            }
            CaptureProgress::Complete(reps) => {
                let kind = capture.kind;
                self.training = None;
                match self.gestures.train(kind, &reps) {
                    Ok(report) => {
                        self.revision += 1;
                        out.push(notify(
                            format!(
                                "Training complete: {} ({} repetitions)",
                                kind.as_str(),
                                report.repetitions
                            ),
                            Severity::Success,
                            now,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, gesture = kind.as_str(), "gesture training failed");
                        out.push(notify(format!("Training failed: {e}"), Severity::Warning, now));
                    }
                }
            }
            CaptureProgress::Waiting | CaptureProgress::Recording => {}
        }
    }

    fn finish_gesture_test(
        &mut self,
        expected: GestureKind,
        detected: GestureKind,
        now: Timestamp,
        out: &mut Vec<ActionIntent>,
    ) {
        self.gesture_test = None;
        if detected == expected {
            tracing::info!(gesture = expected.as_str(), "gesture test passed");
            out.push(notify(
                format!("Gesture test passed: {} detected", expected.as_str()),
                Severity::Success,
                now,
            ));
        } else {
            tracing::info!(
                expected = expected.as_str(),
                detected = detected.as_str(),
                "gesture test failed"
            );
            out.push(notify(
                format!(
                    "Gesture test failed: {} test detected {} instead",
                    expected.as_str(),
                    detected.as_str()
                ),
                Severity::Warning,
                now,
            ));
        }
    }

    fn expire_gesture_test(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        if self.gesture_test.is_some_and(|t| t.deadline <= now) {
            self.gesture_test = None;
            self.gestures.clear();
            tracing::info!("gesture test timed out");
            out.push(notify("Gesture test timed out", Severity::Warning, now));
        }
    }

    fn gesture_timed_out(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        out.push(notify("Gesture timeout: access denied", Severity::Warning, now));
        self.leave_pending(now, "gesture timeout");
    }

    fn apply_deadlines(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        self.poll_session(now, out);
        self.expire_gesture_test(now, out);

        if self.training.as_ref().is_some_and(|t| t.is_expired(now)) {
            self.training = None;
            tracing::warn!("gesture training timed out");
            out.push(notify("Gesture training timed out", Severity::Warning, now));
        }

        for _ in 0..MAX_DEADLINE_STEPS {
            self.settle(now, out);
            match self.deadline {
                Some(d) if d <= now => {}
                _ => return,
            }
            self.deadline = None;
            match self.state {
                SecurityState::OwnerAbsentPendingDim => {
                    self.enter_dimmed(now, 0, "Owner absent: display dimmed to 0%".into(), out)
                }
                SecurityState::Dimmed => self.enter_lock_grace(now, out),
                SecurityState::LockGracePeriod => self.enter_locked(now, out),
                SecurityState::UnknownPendingGesture => self.gesture_timed_out(now, out),
                _ => {}
            }
        }
    }

    /// OwnerPresent is only stable while the owner is present.
    fn settle(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        if self.state == SecurityState::OwnerPresent && !self.presence.state().present {
            out.push(notify("Owner left the desk", Severity::Info, now));
            self.deadline = Some(now);
            self.set_state(SecurityState::OwnerAbsentPendingDim, "owner absent");
        }
    }

    fn poll_session(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        let Some(ended) = self.sessions.poll(now) else {
            return;
        };
        self.session_events.push(SessionEvent::Ended {
            id: ended.id,
            user: ended.user_name,
            at: now,
            reason: SessionEndReason::Expired,
        });
        self.revision += 1;
        self.session_closed(now, out);
    }

    fn session_closed(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        out.push(notify("Trusted session ended", Severity::Info, now));
        if self.state == SecurityState::TrustedSessionActive {
            let resume = self.resume.take().unwrap_or_else(Resume::owner_present);
            self.reenter(now, resume, out);
        }
    }

    /// Re-enter a remembered state with its entry effects.
    fn reenter(&mut self, now: Timestamp, resume: Resume, out: &mut Vec<ActionIntent>) {
        let level = match resume.display {
            DisplayState::Dimmed { level } => level,
            _ => 0,
        };
        match resume.state {
            SecurityState::OwnerAbsentPendingDim => {
                self.deadline = Some(now);
                self.set_state(SecurityState::OwnerAbsentPendingDim, "session ended");
            }
            SecurityState::Dimmed => {
                self.enter_dimmed(now, level, format!("Display dimmed to {level}%"), out)
            }
            SecurityState::LockGracePeriod => {
                out.push(intent(ActionKind::Dim { level }, now));
                self.display = DisplayState::Dimmed { level };
                self.enter_lock_grace(now, out);
            }
            SecurityState::Locked => self.enter_locked(now, out),
            _ => {
                if self.display != DisplayState::Normal {
                    out.push(intent(ActionKind::Restore, now));
                    self.display = DisplayState::Normal;
                }
                self.deadline = None;
                self.set_state(SecurityState::OwnerPresent, "session ended");
            }
        }
    }

    fn enter_dimmed(&mut self, now: Timestamp, level: u8, message: String, out: &mut Vec<ActionIntent>) {
        out.push(intent(ActionKind::Dim { level }, now));
        out.push(notify(message, Severity::Warning, now));
        self.display = DisplayState::Dimmed { level };
        self.deadline = self.lock_deadline(now);
        self.set_state(SecurityState::Dimmed, "dim");
    }

    fn lock_deadline(&self, now: Timestamp) -> Option<Timestamp> {
        self.settings
            .auto_lock_enabled
            .then(|| now + self.settings.dim_phase())
    }

    fn enter_lock_grace(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        let warning = self.settings.warning();
        out.push(notify(
            format!("Locking in {}s", warning.num_seconds()),
            Severity::Alert,
            now,
        ));
        self.deadline = Some(now + warning);
        self.set_state(SecurityState::LockGracePeriod, "lock grace");
    }

    fn enter_locked(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        out.push(intent(ActionKind::Lock, now));
        out.push(notify("Screen locked", Severity::Alert, now));
        self.display = DisplayState::Locked;
        self.deadline = None;
        self.set_state(SecurityState::Locked, "grace elapsed");
    }

    fn owner_returned(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        self.deadline = None;
        self.resume = None;
        self.gestures.clear();
        if self.display != DisplayState::Normal {
            out.push(intent(ActionKind::Restore, now));
            out.push(notify("Owner returned: display restored", Severity::Success, now));
            self.display = DisplayState::Normal;
        }
        self.set_state(SecurityState::OwnerPresent, "owner returned");
    }

    fn arm_unknown(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        if self.rearm_at.is_some_and(|t| now < t) {
            tracing::debug!("unknown face within re-arm cooldown");
            return;
        }
        if self.training.take().is_some() {
            out.push(notify("Gesture training cancelled", Severity::Warning, now));
        }
        if self.gesture_test.take().is_some() {
            out.push(notify("Gesture test cancelled", Severity::Warning, now));
        }

        self.resume = Some(Resume {
            state: self.state,
            display: self.display,
            remaining: self.deadline.map(|d| (d - now).max(Duration::zero())),
        });
        self.deadline = Some(now + Duration::seconds(self.settings.gesture_timeout_secs as i64));
        self.gestures.clear();

        let capture_due = self
            .last_capture_at
            .map_or(true, |t| now - t >= Duration::seconds(CAPTURE_INTERVAL_SECS));
        if capture_due {
            out.push(intent(ActionKind::CaptureUnknownFace, now));
            self.last_capture_at = Some(now);
        } else {
            tracing::debug!("unknown-face capture rate limited");
        }
        out.push(notify(
            "Unknown face detected: nod twice to dim, shake to cancel",
            Severity::Alert,
            now,
        ));
        self.set_state(SecurityState::UnknownPendingGesture, "unknown face");
    }

    fn confirm_nod(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        let nod_level = self.settings.nod_dim_level;
        let level = match self.display {
            DisplayState::Dimmed { level } if level < nod_level => level,
            _ => nod_level,
        };
        if self.display != (DisplayState::Dimmed { level }) {
            out.push(intent(ActionKind::Dim { level }, now));
        }
        out.push(notify(
            format!("Nod confirmed: display dimmed to {level}%"),
            Severity::Warning,
            now,
        ));
        self.display = DisplayState::Dimmed { level };
        self.resume = None;
        self.rearm_at = Some(now + Duration::seconds(UNKNOWN_REARM_SECS));
        self.deadline = self.lock_deadline(now);
        self.set_state(SecurityState::Dimmed, "nod confirmed");
    }

    /// Return to the state a pending confirmation interrupted, with its
    /// suspended deadline.
    fn leave_pending(&mut self, now: Timestamp, reason: &'static str) {
        self.rearm_at = Some(now + Duration::seconds(UNKNOWN_REARM_SECS));
        self.gestures.clear();
        let resume = self.resume.take().unwrap_or_else(Resume::owner_present);
        self.deadline = resume.remaining.map(|r| now + r);
        self.set_state(resume.state, reason);
    }

    /// Apply the pause/resume collaborator's flags.
    pub fn system_status(&mut self, now: Timestamp, status: SystemStatus) -> Vec<ActionIntent> {
        self.system = status;
        let mut out = Vec::new();
        if status.is_paused() && self.state != SecurityState::Paused {
            out.push(intent(ActionKind::Restore, now));
            out.push(intent(ActionKind::ReleaseCamera, now));
            out.push(notify("Monitoring paused: display restored", Severity::Info, now));
            self.deadline = None;
            self.resume = None;
            self.training = None;
            self.gesture_test = None;
            self.gestures.clear();
            self.display = DisplayState::Normal;
            self.set_state(SecurityState::Paused, "system paused");
        } else if !status.is_paused() && self.state == SecurityState::Paused {
            out.push(intent(ActionKind::AcquireCamera, now));
            self.presence.reset(now);
            self.rearm_at = None;
            if self.sessions.active().is_some() {
                self.resume = Some(Resume::owner_present());
                self.set_state(SecurityState::TrustedSessionActive, "system resumed");
            } else {
                self.set_state(SecurityState::OwnerPresent, "system resumed");
            }
        }
        out
    }

    /// External unlock signal.
    pub fn unlocked(&mut self, now: Timestamp) -> Vec<ActionIntent> {
        if self.state != SecurityState::Locked {
            tracing::debug!(state = self.state.as_str(), "unlock signal ignored");
            return Vec::new();
        }
        self.deadline = None;
        self.presence.reset(now);
        self.display = DisplayState::Normal;
        self.set_state(SecurityState::OwnerPresent, "unlocked");
        vec![
            intent(ActionKind::Restore, now),
            notify("Screen unlocked: monitoring re-armed", Severity::Success, now),
        ]
    }

    pub fn execute(&mut self, now: Timestamp, command: Command) -> Result<Vec<ActionIntent>, CommandError> {
        tracing::debug!(command = command.name(), "executing command");
        let persists = !matches!(command, Command::RestoreNow | Command::TestGesture(_));
        let mut out = Vec::new();
        match command {
            Command::RestoreNow => self.restore_now(now, &mut out),
            Command::StartTrustedSession { key, user } => {
                self.start_session(now, &user, &key, &mut out)?
            }
            Command::EndTrustedSession => {
                let ended = self.sessions.end()?;
                self.session_events.push(SessionEvent::Ended {
                    id: ended.id,
                    user: ended.user_name,
                    at: now,
                    reason: SessionEndReason::Explicit,
                });
                self.session_closed(now, &mut out);
            }
            Command::SetKey {
                secret,
                timeout_minutes,
            } => self.sessions.set_key(&secret, timeout_minutes)?,
            Command::ClearKey => {
                if let Some(ended) = self.sessions.clear_key() {
                    self.session_events.push(SessionEvent::Ended {
                        id: ended.id,
                        user: ended.user_name,
                        at: now,
                        reason: SessionEndReason::KeyCleared,
                    });
                    self.session_closed(now, &mut out);
                }
                tracing::info!("trusted session key cleared");
            }
            Command::Calibrate(samples) => {
                self.gestures.calibrate(&samples)?;
                out.push(notify("Gesture calibration complete", Severity::Success, now));
            }
            Command::Train { kind, repetitions } => {
                match self.state {
                    SecurityState::Paused => return Err(CommandError::Paused),
                    SecurityState::UnknownPendingGesture => return Err(CommandError::GesturePending),
                    _ => {}
                }
                let target = repetitions.clamp(TRAINING_REPETITIONS_RANGE.0, TRAINING_REPETITIONS_RANGE.1);
                self.gesture_test = None;
                self.training = Some(TrainingCapture::new(
                    kind,
                    target,
                    self.gestures.thresholds(),
                    now + Duration::seconds(TRAINING_TIMEOUT_SECS),
                ));
                tracing::info!(gesture = kind.as_str(), target, "gesture training started");
                out.push(notify(
                    format!("Training {}: perform {target} repetitions", kind.as_str()),
                    Severity::Info,
                    now,
                ));
            }
            Command::TestGesture(kind) => {
                match self.state {
                    SecurityState::Paused => return Err(CommandError::Paused),
                    SecurityState::UnknownPendingGesture => return Err(CommandError::GesturePending),
                    _ => {}
                }
                if self.training.take().is_some() {
                    out.push(notify("Gesture training cancelled", Severity::Warning, now));
                }
                self.gestures.clear();
                self.gesture_test = Some(GestureTest {
                    kind,
                    deadline: now + Duration::seconds(GESTURE_TEST_SECS),
                });
                tracing::info!(gesture = kind.as_str(), "gesture test started");
                out.push(notify(
                    format!("Gesture test: {} within {GESTURE_TEST_SECS}s", kind.as_str()),
                    Severity::Info,
                    now,
                ));
            }
            Command::SetAbsenceDelay(secs) => {
                let secs = secs.clamp(ABSENCE_DELAY_RANGE.0, ABSENCE_DELAY_RANGE.1);
                self.settings.absence_delay_secs = secs;
                self.presence.set_absence_delay(Duration::seconds(secs as i64));
                tracing::info!(secs, "absence delay set");
            }
            Command::SetLockGracePeriod(secs) => {
                let secs = secs.clamp(LOCK_GRACE_RANGE.0, LOCK_GRACE_RANGE.1);
                self.settings.lock_grace_period_secs = secs;
                tracing::info!(secs, "lock grace period set");
            }
            Command::SetAutoLockEnabled(enabled) => self.set_auto_lock(now, enabled),
        }
        if persists {
            self.revision += 1;
        }
        Ok(out)
    }

    fn restore_now(&mut self, now: Timestamp, out: &mut Vec<ActionIntent>) {
        out.push(intent(ActionKind::Restore, now));
        if self.state == SecurityState::Paused {
            return;
        }
        out.push(notify("Display restored", Severity::Success, now));
        if self.state == SecurityState::UnknownPendingGesture {
            self.rearm_at = Some(now + Duration::seconds(UNKNOWN_REARM_SECS));
        }
        self.deadline = None;
        self.training = None;
        self.gesture_test = None;
        self.gestures.clear();
        self.presence.reset(now);
        self.display = DisplayState::Normal;
        if self.state == SecurityState::TrustedSessionActive {
            self.resume = Some(Resume::owner_present());
        } else {
            self.resume = None;
            self.set_state(SecurityState::OwnerPresent, "manual restore");
        }
    }

    fn start_session(
        &mut self,
        now: Timestamp,
        user: &str,
        key: &str,
        out: &mut Vec<ActionIntent>,
    ) -> Result<(), CommandError> {
        if self.state == SecurityState::Paused {
            return Err(CommandError::Paused);
        }
        let previous = self.sessions.active().cloned();
        let session = match self.sessions.start(user, key, now) {
            Ok(s) => s,
            Err(e) => {
                if let SessionError::InvalidKey { attempts } = e {
                    self.session_events.push(SessionEvent::Rejected { attempts, at: now });
                }
                return Err(e.into());
            }
        };
        if let Some(prev) = previous {
            self.session_events.push(SessionEvent::Ended {
                id: prev.id,
                user: prev.user_name,
                at: now,
                reason: SessionEndReason::Replaced,
            });
        }
        self.session_events.push(SessionEvent::Started {
            id: session.id,
            user: session.user_name,
            at: now,
        });

        if self.state != SecurityState::TrustedSessionActive {
            let resume = if self.state == SecurityState::UnknownPendingGesture {
                tracing::info!("trusted session cancels pending confirmation");
                self.rearm_at = Some(now + Duration::seconds(UNKNOWN_REARM_SECS));
                self.resume.take().unwrap_or_else(Resume::owner_present)
            } else {
                Resume {
                    state: self.state,
                    display: self.display,
                    remaining: None,
                }
            };
            self.resume = Some(Resume {
                remaining: None,
                ..resume
            });
            self.deadline = None;
            self.gestures.clear();
            if self.display != DisplayState::Normal {
                out.push(intent(ActionKind::Restore, now));
                self.display = DisplayState::Normal;
            }
            self.set_state(SecurityState::TrustedSessionActive, "trusted session started");
        }
        out.push(notify(
            format!("Trusted session started for {user}"),
            Severity::Success,
            now,
        ));
        Ok(())
    }

    fn set_auto_lock(&mut self, now: Timestamp, enabled: bool) {
        self.settings.auto_lock_enabled = enabled;
        tracing::info!(enabled, "auto-lock set");
        if enabled {
            if self.state == SecurityState::Dimmed && self.deadline.is_none() {
                self.deadline = self.lock_deadline(now);
            }
            return;
        }
        match self.state {
            SecurityState::Dimmed => self.deadline = None,
            SecurityState::LockGracePeriod => {
                self.deadline = None;
                self.set_state(SecurityState::Dimmed, "auto-lock disabled");
            }
            SecurityState::UnknownPendingGesture => {
                if let Some(r) = self.resume.as_mut() {
                    if r.state == SecurityState::Dimmed {
                        r.remaining = None;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            settings: self.settings,
            thresholds: *self.gestures.thresholds(),
            trained: self.gestures.trained().clone(),
            session_key: self.sessions.key_config().cloned(),
            session: self.sessions.session_runtime().cloned(),
        }
    }

    /// Load persisted structures. A still-active session re-enters
    /// `TrustedSessionActive`; an expired one ends on the next tick.
    pub fn restore(&mut self, now: Timestamp, persisted: PersistedState) {
        self.settings = persisted.settings.clamped();
        self.presence = PresenceTracker::new(self.settings.presence_config());
        self.gestures.set_thresholds(persisted.thresholds);
        self.gestures.set_trained(persisted.trained);
        self.sessions.set_key_config(persisted.session_key);
        self.sessions.restore_session(persisted.session);

        let restorable = !matches!(
            self.state,
            SecurityState::Paused | SecurityState::TrustedSessionActive
        );
        if self.sessions.active().is_some() && restorable {
            self.resume = Some(Resume {
                state: self.state,
                display: self.display,
                remaining: None,
            });
            self.deadline = None;
            self.set_state(SecurityState::TrustedSessionActive, "session restored");
        }
        tracing::debug!(at = %now, "persisted state restored");
    }
}
