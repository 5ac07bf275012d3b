use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock instant used for every observation, deadline and intent.
pub type Timestamp = DateTime<Utc>;

/// A 2D landmark position in frame pixel coordinates (y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Facial landmarks delivered by the external landmark extractor.
///
/// Every point is optional: extractors drop points on partial occlusion and
/// the orientation estimator degrades to a heuristic when the full set is
/// missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Option<Point>,
    pub right_eye: Option<Point>,
    pub nose_tip: Option<Point>,
    pub chin: Option<Point>,
    pub mouth_left: Option<Point>,
    pub mouth_right: Option<Point>,
}

impl Landmarks {
    /// Number of points present.
    pub fn count(&self) -> usize {
        [
            self.left_eye,
            self.right_eye,
            self.nose_tip,
            self.chin,
            self.mouth_left,
            self.mouth_right,
        ]
        .iter()
        .filter(|p| p.is_some())
        .count()
    }
}

/// Bounding box of a face the recognizer could not match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Per-frame recognition verdict from the external recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameObservation {
    pub timestamp: Timestamp,
    pub owner_matched: bool,
    /// Face distance to the enrolled owner, when the recognizer reports one.
    #[serde(default)]
    pub owner_distance: Option<f32>,
    /// Name of an enrolled trusted person seen in the frame.
    #[serde(default)]
    pub trusted_match_name: Option<String>,
    pub unknown_face_present: bool,
    #[serde(default)]
    pub unknown_faces: Vec<FaceBox>,
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
}

impl FrameObservation {
    /// An empty frame: nobody in view.
    pub fn empty(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            owner_matched: false,
            owner_distance: None,
            trusted_match_name: None,
            unknown_face_present: false,
            unknown_faces: Vec::new(),
            landmarks: None,
        }
    }

    /// The owner alone in view.
    pub fn owner(timestamp: Timestamp) -> Self {
        Self {
            owner_matched: true,
            ..Self::empty(timestamp)
        }
    }

    /// A single unrecognised face in view.
    pub fn unknown(timestamp: Timestamp) -> Self {
        Self {
            unknown_face_present: true,
            ..Self::empty(timestamp)
        }
    }

    pub fn with_landmarks(mut self, landmarks: Landmarks) -> Self {
        self.landmarks = Some(landmarks);
        self
    }
}

/// Severity attached to a notification intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Alert,
}

/// Side effect requested from the action collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Set display brightness to `level` percent (0–100).
    Dim { level: u8 },
    Lock,
    Restore,
    Notify { message: String, severity: Severity },
    CaptureUnknownFace,
    ReleaseCamera,
    AcquireCamera,
}

/// An emitted, never stored, request for a side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionIntent {
    #[serde(flatten)]
    pub kind: ActionKind,
    pub timestamp: Timestamp,
}

impl ActionIntent {
    pub fn new(kind: ActionKind, timestamp: Timestamp) -> Self {
        Self { kind, timestamp }
    }

    pub fn notify(message: impl Into<String>, severity: Severity, timestamp: Timestamp) -> Self {
        Self::new(
            ActionKind::Notify {
                message: message.into(),
                severity,
            },
            timestamp,
        )
    }

    /// JSON wire form used by the D-Bus `Action` signal.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Locked/sleeping flags reported by the pause/resume collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub locked: bool,
    pub sleeping: bool,
}

impl SystemStatus {
    pub fn is_paused(&self) -> bool {
        self.locked || self.sleeping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_landmark_count() {
        let mut lm = Landmarks::default();
        assert_eq!(lm.count(), 0);
        lm.nose_tip = Some(Point::new(1.0, 2.0));
        lm.left_eye = Some(Point::new(0.0, 0.0));
        assert_eq!(lm.count(), 2);
    }

    #[test]
    fn test_system_status_paused() {
        assert!(!SystemStatus::default().is_paused());
        assert!(SystemStatus { locked: true, sleeping: false }.is_paused());
        assert!(SystemStatus { locked: false, sleeping: true }.is_paused());
    }

    #[test]
    fn test_intent_json_shape() {
        let intent = ActionIntent::new(ActionKind::Dim { level: 25 }, t0());
        let value: serde_json::Value = serde_json::from_str(&intent.to_json()).unwrap();
        assert_eq!(value["kind"], "dim");
        assert_eq!(value["level"], 25);
        assert!(value["timestamp"].is_string());

        let notify = ActionIntent::notify("Screen locked", Severity::Alert, t0());
        let value: serde_json::Value = serde_json::from_str(&notify.to_json()).unwrap();
        assert_eq!(value["kind"], "notify");
        assert_eq!(value["severity"], "alert");
        assert_eq!(value["message"], "Screen locked");
    }

    #[test]
    fn test_observation_deserialize_minimal() {
        let json = r#"{"timestamp":"2026-01-05T09:00:00Z","owner_matched":false,"unknown_face_present":true}"#;
        let obs: FrameObservation = serde_json::from_str(json).unwrap();
        assert!(obs.unknown_face_present);
        assert!(obs.landmarks.is_none());
        assert!(obs.trusted_match_name.is_none());
        assert_eq!(obs.timestamp, t0());
    }
}
