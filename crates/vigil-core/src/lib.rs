//! vigil-core — Owner presence, head gestures and the workstation security
//! state machine.
//!
//! Pure and synchronous: consumes recognition observations, emits
//! [`ActionIntent`]s, and never performs I/O. Hosts drive it through
//! [`SecurityStateMachine`].

pub mod gesture;
pub mod machine;
pub mod pose;
pub mod presence;
pub mod session;
pub mod types;

pub use gesture::{GestureKind, GestureThresholds, OrientationSample};
pub use machine::{
    Command, CommandError, MachineSettings, MachineStatus, PersistedState, SecurityState,
    SecurityStateMachine, SessionEvent,
};
pub use session::SessionError;
pub use types::{ActionIntent, ActionKind, FrameObservation, Severity, SystemStatus, Timestamp};
