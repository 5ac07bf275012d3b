//! Head orientation from six facial landmarks.
//!
//! Fits a scaled-orthographic camera to a generic 3D face model by
//! least squares, recovers the rotation and reports pitch/yaw in degrees.
//! When the full landmark set is missing or the fit degenerates, falls back
//! to a closed-form estimate from the nose tip displacement against the
//! eye line.

use crate::types::{Landmarks, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generic face model in camera axes (x right, y down, z away from camera),
/// nose tip at the origin. Eyes and mouth corners are named by image side.
const MODEL_LEFT_EYE: [f64; 3] = [-225.0, -170.0, 135.0];
const MODEL_RIGHT_EYE: [f64; 3] = [225.0, -170.0, 135.0];
const MODEL_NOSE_TIP: [f64; 3] = [0.0, 0.0, 0.0];
const MODEL_CHIN: [f64; 3] = [0.0, 330.0, 65.0];
const MODEL_MOUTH_LEFT: [f64; 3] = [-150.0, 150.0, 125.0];
const MODEL_MOUTH_RIGHT: [f64; 3] = [150.0, 150.0, 125.0];

/// Points required for the full pose solve.
pub const MIN_SOLVE_POINTS: usize = 6;

/// Nose protrusion in front of the eye plane, relative to eye distance.
const NOSE_DEPTH_RATIO: f64 = (MODEL_LEFT_EYE[2] - MODEL_NOSE_TIP[2])
    / (MODEL_RIGHT_EYE[0] - MODEL_LEFT_EYE[0]);
/// Nose drop below the eye line at rest, relative to eye distance.
const NOSE_DROP_RATIO: f64 = (MODEL_NOSE_TIP[1] - MODEL_LEFT_EYE[1])
    / (MODEL_RIGHT_EYE[0] - MODEL_LEFT_EYE[0]);

const EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("not enough landmarks for an estimate: {found} present, eyes and nose tip required")]
    InsufficientLandmarks { found: usize },
    #[error("landmarks are numerically degenerate")]
    Degenerate,
}

/// How an orientation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoseMethod {
    Solved,
    Heuristic,
}

/// Head orientation in degrees, rotations about the camera x (pitch) and
/// y (yaw) axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub pitch: f32,
    pub yaw: f32,
    pub method: PoseMethod,
}

/// Estimate head orientation for one frame. Never panics: returns the best
/// available estimate or a [`PoseError`] meaning "unavailable for this frame".
pub fn estimate(landmarks: &Landmarks) -> Result<Orientation, PoseError> {
    if landmarks.count() >= MIN_SOLVE_POINTS {
        match solve(landmarks) {
            Ok(o) => return Ok(o),
            Err(e) => tracing::debug!(error = %e, "pose solve failed; using heuristic"),
        }
    }
    heuristic(landmarks)
}

fn to_f64(p: Point) -> [f64; 2] {
    [p.x as f64, p.y as f64]
}

/// Least-squares scaled-orthographic fit of the six-point model.
fn solve(lm: &Landmarks) -> Result<Orientation, PoseError> {
    let pairs = [
        (lm.left_eye, MODEL_LEFT_EYE),
        (lm.right_eye, MODEL_RIGHT_EYE),
        (lm.nose_tip, MODEL_NOSE_TIP),
        (lm.chin, MODEL_CHIN),
        (lm.mouth_left, MODEL_MOUTH_LEFT),
        (lm.mouth_right, MODEL_MOUTH_RIGHT),
    ];

    let mut image = Vec::with_capacity(pairs.len());
    let mut model = Vec::with_capacity(pairs.len());
    for (p, m) in pairs {
        let p = p.ok_or(PoseError::InsufficientLandmarks { found: lm.count() })?;
        image.push(to_f64(p));
        model.push(m);
    }
    let n = image.len() as f64;

    // Center both point sets; orthographic projection maps centroid to centroid.
    let mut img_mean = [0.0f64; 2];
    let mut mdl_mean = [0.0f64; 3];
    for (p, m) in image.iter().zip(&model) {
        for k in 0..2 {
            img_mean[k] += p[k] / n;
        }
        for k in 0..3 {
            mdl_mean[k] += m[k] / n;
        }
    }

    // A = Pc * Pc^T (3x3), B = U * Pc^T (2x3)
    let mut a = [[0.0f64; 3]; 3];
    let mut b = [[0.0f64; 3]; 2];
    for (p, m) in image.iter().zip(&model) {
        let pc = [m[0] - mdl_mean[0], m[1] - mdl_mean[1], m[2] - mdl_mean[2]];
        let uc = [p[0] - img_mean[0], p[1] - img_mean[1]];
        for i in 0..3 {
            for j in 0..3 {
                a[i][j] += pc[i] * pc[j];
            }
        }
        for i in 0..2 {
            for j in 0..3 {
                b[i][j] += uc[i] * pc[j];
            }
        }
    }

    let a_inv = invert_3x3(&a).ok_or(PoseError::Degenerate)?;

    // M = B * A^-1: rows are the scaled first two rows of the rotation.
    let mut m = [[0.0f64; 3]; 2];
    for i in 0..2 {
        for j in 0..3 {
            m[i][j] = (0..3).map(|k| b[i][k] * a_inv[k][j]).sum();
        }
    }

    let r1 = normalize(m[0]).ok_or(PoseError::Degenerate)?;
    // Gram-Schmidt the second row against the first.
    let d = dot(r1, m[1]);
    let r2 = normalize([m[1][0] - d * r1[0], m[1][1] - d * r1[1], m[1][2] - d * r1[2]])
        .ok_or(PoseError::Degenerate)?;
    let r3 = cross(r1, r2);

    // R = Rz(roll) * Ry(yaw) * Rx(pitch); read pitch and yaw off the third row.
    let pitch = r3[1].atan2(r3[2]).to_degrees();
    let yaw = (-r3[0]).atan2((r3[1] * r3[1] + r3[2] * r3[2]).sqrt()).to_degrees();

    if !pitch.is_finite() || !yaw.is_finite() {
        return Err(PoseError::Degenerate);
    }

    Ok(Orientation {
        pitch: pitch as f32,
        yaw: yaw as f32,
        method: PoseMethod::Solved,
    })
}

/// Nose tip displacement against the eye line, inverted through the same
/// face model as the full solve.
fn heuristic(lm: &Landmarks) -> Result<Orientation, PoseError> {
    let (Some(le), Some(re), Some(nose)) = (lm.left_eye, lm.right_eye, lm.nose_tip) else {
        return Err(PoseError::InsufficientLandmarks { found: lm.count() });
    };
    let (le, re, nose) = (to_f64(le), to_f64(re), to_f64(nose));

    let eye_dist = ((re[0] - le[0]).powi(2) + (re[1] - le[1]).powi(2)).sqrt();
    if eye_dist < EPSILON {
        return Err(PoseError::Degenerate);
    }
    let mid = [(le[0] + re[0]) / 2.0, (le[1] + re[1]) / 2.0];

    // Horizontal: offset = -depth * tan(yaw) in eye-distance units.
    let dx = (nose[0] - mid[0]) / eye_dist;
    let yaw = (-dx / NOSE_DEPTH_RATIO).atan();

    // Vertical: drop = rest_drop * cos(pitch) + depth * sin(pitch).
    let dy = (nose[1] - mid[1]) / eye_dist;
    let amp = (NOSE_DROP_RATIO.powi(2) + NOSE_DEPTH_RATIO.powi(2)).sqrt();
    let phase = NOSE_DROP_RATIO.atan2(NOSE_DEPTH_RATIO);
    let pitch = (dy / amp).clamp(-1.0, 1.0).asin() - phase;

    Ok(Orientation {
        pitch: pitch.to_degrees() as f32,
        yaw: yaw.to_degrees() as f32,
        method: PoseMethod::Heuristic,
    })
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = dot(v, v).sqrt();
    if norm < EPSILON || !norm.is_finite() {
        return None;
    }
    Some([v[0] / norm, v[1] / norm, v[2] / norm])
}

/// Invert a 3×3 matrix via the adjugate. `None` when singular.
fn invert_3x3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let c00 = m[1][1] * m[2][2] - m[1][2] * m[2][1];
    let c01 = m[1][2] * m[2][0] - m[1][0] * m[2][2];
    let c02 = m[1][0] * m[2][1] - m[1][1] * m[2][0];
    let det = m[0][0] * c00 + m[0][1] * c01 + m[0][2] * c02;
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            c00 * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            c01 * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            c02 * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Project the face model rotated by `Ry(yaw) * Rx(pitch)` onto the image
    /// plane at scale `s`, centered at (320, 240).
    pub(crate) fn project(pitch_deg: f64, yaw_deg: f64, s: f64) -> Landmarks {
        let (sp, cp) = pitch_deg.to_radians().sin_cos();
        let (sy, cy) = yaw_deg.to_radians().sin_cos();
        let rx = [[1.0, 0.0, 0.0], [0.0, cp, -sp], [0.0, sp, cp]];
        let ry = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
        let mut r = [[0.0f64; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                r[i][j] = (0..3).map(|k| ry[i][k] * rx[k][j]).sum();
            }
        }
        let proj = |m: [f64; 3]| {
            let x = r[0][0] * m[0] + r[0][1] * m[1] + r[0][2] * m[2];
            let y = r[1][0] * m[0] + r[1][1] * m[1] + r[1][2] * m[2];
            Some(Point::new((320.0 + s * x) as f32, (240.0 + s * y) as f32))
        };
        Landmarks {
            left_eye: proj(MODEL_LEFT_EYE),
            right_eye: proj(MODEL_RIGHT_EYE),
            nose_tip: proj(MODEL_NOSE_TIP),
            chin: proj(MODEL_CHIN),
            mouth_left: proj(MODEL_MOUTH_LEFT),
            mouth_right: proj(MODEL_MOUTH_RIGHT),
        }
    }

    #[test]
    fn test_frontal_face_is_zero() {
        let o = estimate(&project(0.0, 0.0, 0.3)).unwrap();
        assert_eq!(o.method, PoseMethod::Solved);
        assert!(o.pitch.abs() < 0.1, "pitch = {}", o.pitch);
        assert!(o.yaw.abs() < 0.1, "yaw = {}", o.yaw);
    }

    #[test]
    fn test_solve_recovers_pitch_and_yaw() {
        for (pitch, yaw) in [(15.0, 0.0), (0.0, -20.0), (-10.0, 12.0)] {
            let o = estimate(&project(pitch, yaw, 0.25)).unwrap();
            assert_eq!(o.method, PoseMethod::Solved);
            assert!((o.pitch as f64 - pitch).abs() < 0.5, "pitch {} vs {pitch}", o.pitch);
            assert!((o.yaw as f64 - yaw).abs() < 0.5, "yaw {} vs {yaw}", o.yaw);
        }
    }

    #[test]
    fn test_heuristic_used_without_chin() {
        let mut lm = project(0.0, 18.0, 0.3);
        lm.chin = None;
        let o = estimate(&lm).unwrap();
        assert_eq!(o.method, PoseMethod::Heuristic);
        assert!((o.yaw - 18.0).abs() < 0.5, "yaw = {}", o.yaw);
        assert!(o.pitch.abs() < 0.5, "pitch = {}", o.pitch);
    }

    #[test]
    fn test_heuristic_pitch_matches_solve() {
        let mut lm = project(12.0, 0.0, 0.3);
        lm.mouth_left = None;
        let o = estimate(&lm).unwrap();
        assert_eq!(o.method, PoseMethod::Heuristic);
        assert!((o.pitch - 12.0).abs() < 0.5, "pitch = {}", o.pitch);
    }

    #[test]
    fn test_coincident_points_unavailable() {
        let p = Some(Point::new(100.0, 100.0));
        let lm = Landmarks {
            left_eye: p,
            right_eye: p,
            nose_tip: p,
            chin: p,
            mouth_left: p,
            mouth_right: p,
        };
        assert_eq!(estimate(&lm), Err(PoseError::Degenerate));
    }

    #[test]
    fn test_missing_nose_unavailable() {
        let mut lm = project(0.0, 0.0, 0.3);
        lm.nose_tip = None;
        lm.chin = None;
        assert_eq!(
            estimate(&lm),
            Err(PoseError::InsufficientLandmarks { found: 4 })
        );
    }

    #[test]
    fn test_invert_identity() {
        let id = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(invert_3x3(&id), Some(id));
        let singular = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]];
        assert!(invert_3x3(&singular).is_none());
    }
}
