//! Head-gesture recognition: nod (confirm) and shake (cancel).
//!
//! Keeps a time-windowed buffer of orientation samples. Detection runs two
//! ways: amplitude crossings against calibrated thresholds, and, once the
//! user has trained a gesture, normalized cross-correlation against the
//! stored repetitions. A shake candidate always outranks a nod candidate.

use crate::types::Timestamp;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Points both signals are resampled to before correlation.
const RESAMPLE_POINTS: usize = 32;
/// A window must cover this share of a template's duration to be compared.
const MIN_TEMPLATE_COVERAGE: f32 = 0.9;
/// Training floor sits this far below the mean pairwise repetition score.
const FLOOR_MARGIN: f32 = 0.15;
const FLOOR_MIN: f32 = 0.5;
const FLOOR_MAX: f32 = 0.95;

// Interactive capture segmentation.
const CAPTURE_START_DEG: f32 = 5.0;
const CAPTURE_REST_DEG: f32 = 2.0;
const CAPTURE_REST_MS: i64 = 250;
const CAPTURE_MIN_REP_MS: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Nod,
    Shake,
}

impl GestureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nod => "nod",
            Self::Shake => "shake",
        }
    }

    /// Nods move pitch, shakes move yaw.
    fn primary(&self, pitch: f32, yaw: f32) -> f32 {
        match self {
            Self::Nod => pitch,
            Self::Shake => yaw,
        }
    }

    fn secondary(&self, pitch: f32, yaw: f32) -> f32 {
        match self {
            Self::Nod => yaw,
            Self::Shake => pitch,
        }
    }
}

impl std::str::FromStr for GestureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nod" => Ok(Self::Nod),
            "shake" => Ok(Self::Shake),
            other => Err(format!("unknown gesture '{other}', expected nod or shake")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationSample {
    pub timestamp: Timestamp,
    pub pitch: f32,
    pub yaw: f32,
}

impl OrientationSample {
    pub fn new(timestamp: Timestamp, pitch: f32, yaw: f32) -> Self {
        Self { timestamp, pitch, yaw }
    }
}

/// Detection thresholds, overwritten by calibration and training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GestureThresholds {
    pub pitch_amplitude: f32,
    pub yaw_amplitude: f32,
    pub min_cycles: u32,
    pub max_gesture_duration_ms: u64,
    /// Rest-pose pitch subtracted before threshold comparison.
    #[serde(default)]
    pub baseline_pitch: f32,
    #[serde(default)]
    pub baseline_yaw: f32,
}

impl Default for GestureThresholds {
    fn default() -> Self {
        Self {
            pitch_amplitude: 12.0,
            yaw_amplitude: 15.0,
            min_cycles: 2,
            max_gesture_duration_ms: 6000,
            baseline_pitch: 0.0,
            baseline_yaw: 0.0,
        }
    }
}

impl GestureThresholds {
    fn amplitude(&self, kind: GestureKind) -> f32 {
        match kind {
            GestureKind::Nod => self.pitch_amplitude,
            GestureKind::Shake => self.yaw_amplitude,
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.max_gesture_duration_ms as i64)
    }
}

/// Tuning that is not learned from the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GestureConfig {
    /// Calibrated amplitude = k × rest standard deviation.
    pub calibration_k: f32,
    pub min_amplitude: f32,
    pub max_amplitude: f32,
    /// Minimum spacing between two counted crossings.
    pub debounce_ms: i64,
    /// Buffer must span at least this long before anything is evaluated.
    pub min_span_ms: i64,
    pub min_samples: usize,
    pub min_calibration_samples: usize,
    pub min_repetitions: usize,
    /// Primary-axis peak-to-peak range a repetition must exceed to be kept.
    pub min_repetition_range: f32,
    /// Trained amplitude = ratio × mean repetition range.
    pub training_amplitude_ratio: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            calibration_k: 3.0,
            min_amplitude: 4.0,
            max_amplitude: 30.0,
            debounce_ms: 150,
            min_span_ms: 400,
            min_samples: 3,
            min_calibration_samples: 10,
            min_repetitions: 3,
            min_repetition_range: 5.0,
            training_amplitude_ratio: 0.3,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GestureError {
    #[error("not enough data: {samples} samples, {required} required")]
    NotEnoughData { samples: usize, required: usize },
    #[error("not enough usable repetitions: {usable} of {required} required")]
    NotEnoughRepetitions { usable: usize, required: usize },
}

/// One point of a recorded repetition, relative to its start and the rest pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemplatePoint {
    pub t_ms: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// A single recorded repetition of a gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureTemplate {
    pub kind: GestureKind,
    pub samples: Vec<TemplatePoint>,
}

impl GestureTemplate {
    fn from_samples(kind: GestureKind, samples: &[OrientationSample], t: &GestureThresholds) -> Self {
        let start = samples.first().map(|s| s.timestamp);
        let samples = samples
            .iter()
            .map(|s| TemplatePoint {
                t_ms: start
                    .map(|t0| (s.timestamp - t0).num_milliseconds() as f32)
                    .unwrap_or(0.0),
                pitch: s.pitch - t.baseline_pitch,
                yaw: s.yaw - t.baseline_yaw,
            })
            .collect();
        Self { kind, samples }
    }

    pub fn duration_ms(&self) -> f32 {
        self.samples.last().map(|p| p.t_ms).unwrap_or(0.0)
    }

    fn primary_series(&self) -> Vec<(f32, f32)> {
        self.samples
            .iter()
            .map(|p| (p.t_ms, self.kind.primary(p.pitch, p.yaw)))
            .collect()
    }
}

/// All templates of one kind plus the score a live window must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSet {
    pub templates: Vec<GestureTemplate>,
    pub confidence_floor: f32,
}

/// Persisted training output for both gestures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainedGestures {
    pub nod: Option<TemplateSet>,
    pub shake: Option<TemplateSet>,
}

impl TrainedGestures {
    pub fn get(&self, kind: GestureKind) -> Option<&TemplateSet> {
        match kind {
            GestureKind::Nod => self.nod.as_ref(),
            GestureKind::Shake => self.shake.as_ref(),
        }
    }

    fn set(&mut self, kind: GestureKind, set: TemplateSet) {
        match kind {
            GestureKind::Nod => self.nod = Some(set),
            GestureKind::Shake => self.shake = Some(set),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionMethod {
    Threshold,
    Template { score: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub kind: GestureKind,
    pub method: DetectionMethod,
}

/// Outcome of evaluating the buffered window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    NotEnoughData,
    NoPattern,
    Detected(Detection),
}

/// Summary of a completed training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub kind: GestureKind,
    pub repetitions: usize,
    pub confidence_floor: f32,
    pub amplitude: f32,
}

pub struct GestureRecognizer {
    config: GestureConfig,
    thresholds: GestureThresholds,
    trained: TrainedGestures,
    buffer: VecDeque<OrientationSample>,
}

impl Default for GestureRecognizer {
    fn default() -> Self {
        Self::new(GestureConfig::default(), GestureThresholds::default())
    }
}

impl GestureRecognizer {
    pub fn new(config: GestureConfig, thresholds: GestureThresholds) -> Self {
        Self {
            config,
            thresholds,
            trained: TrainedGestures::default(),
            buffer: VecDeque::new(),
        }
    }

    pub fn thresholds(&self) -> &GestureThresholds {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: GestureThresholds) {
        self.thresholds = thresholds;
    }

    pub fn trained(&self) -> &TrainedGestures {
        &self.trained
    }

    pub fn set_trained(&mut self, trained: TrainedGestures) {
        self.trained = trained;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a sample, evict everything outside the window, and evaluate.
    /// A detection consumes the buffer so one gesture is reported once.
    pub fn observe(&mut self, sample: OrientationSample) -> Evaluation {
        // Out-of-order samples would corrupt crossing spacing.
        if let Some(last) = self.buffer.back() {
            if sample.timestamp < last.timestamp {
                tracing::debug!("dropping out-of-order orientation sample");
                return Evaluation::NoPattern;
            }
        }
        self.buffer.push_back(sample);
        let cutoff = sample.timestamp - self.thresholds.window();
        while self.buffer.front().is_some_and(|s| s.timestamp < cutoff) {
            self.buffer.pop_front();
        }

        let eval = self.evaluate();
        if let Evaluation::Detected(d) = eval {
            tracing::info!(gesture = d.kind.as_str(), method = ?d.method, "gesture detected");
            self.buffer.clear();
        }
        eval
    }

    /// Evaluate the current buffer without mutating it.
    pub fn evaluate(&self) -> Evaluation {
        let (Some(first), Some(last)) = (self.buffer.front(), self.buffer.back()) else {
            return Evaluation::NotEnoughData;
        };
        let span = (last.timestamp - first.timestamp).num_milliseconds();
        if self.buffer.len() < self.config.min_samples || span < self.config.min_span_ms {
            return Evaluation::NotEnoughData;
        }

        let nod = self.candidate(GestureKind::Nod);
        let shake = self.candidate(GestureKind::Shake);

        match (nod, shake) {
            (Some(_), Some(s)) => {
                tracing::debug!("ambiguous nod and shake in one window; shake wins");
                Evaluation::Detected(s)
            }
            (None, Some(s)) => Evaluation::Detected(s),
            (Some(n), None) => Evaluation::Detected(n),
            (None, None) => Evaluation::NoPattern,
        }
    }

    /// Template match first, thresholds as fallback.
    fn candidate(&self, kind: GestureKind) -> Option<Detection> {
        if let Some(score) = self.template_score(kind) {
            return Some(Detection {
                kind,
                method: DetectionMethod::Template { score },
            });
        }
        let crossings = self.crossings(kind);
        (crossings >= self.thresholds.min_cycles).then_some(Detection {
            kind,
            method: DetectionMethod::Threshold,
        })
    }

    /// Number of debounced sign changes of the baseline-corrected primary axis
    /// beyond ±amplitude.
    fn crossings(&self, kind: GestureKind) -> u32 {
        let t = &self.thresholds;
        let amp = t.amplitude(kind);
        let debounce = Duration::milliseconds(self.config.debounce_ms);

        let mut count = 0;
        let mut last_sign = 0i8;
        let mut last_change: Option<Timestamp> = None;

        for s in &self.buffer {
            let v = kind.primary(s.pitch - t.baseline_pitch, s.yaw - t.baseline_yaw);
            let sign = if v > amp {
                1
            } else if v < -amp {
                -1
            } else {
                0
            };
            if sign == 0 || sign == last_sign {
                continue;
            }
            match last_change {
                None => {
                    last_sign = sign;
                    last_change = Some(s.timestamp);
                }
                Some(prev) if s.timestamp - prev >= debounce => {
                    count += 1;
                    last_sign = sign;
                    last_change = Some(s.timestamp);
                }
                Some(_) => {}
            }
        }
        count
    }

    /// Best correlation against the trained templates of `kind`, if it clears
    /// the trained floor.
    fn template_score(&self, kind: GestureKind) -> Option<f32> {
        let set = self.trained.get(kind)?;
        let last = self.buffer.back()?.timestamp;
        let amp = self.thresholds.amplitude(kind);

        let mut best: Option<f32> = None;
        for template in &set.templates {
            let duration = template.duration_ms();
            if duration <= 0.0 {
                continue;
            }
            let start = last - Duration::milliseconds(duration as i64);
            let window: Vec<&OrientationSample> =
                self.buffer.iter().filter(|s| s.timestamp >= start).collect();
            let Some(first) = window.first() else {
                continue;
            };
            let covered = (last - first.timestamp).num_milliseconds() as f32;
            if window.len() < 2 || covered < duration * MIN_TEMPLATE_COVERAGE {
                continue;
            }

            let primary: Vec<(f32, f32)> = window
                .iter()
                .map(|s| {
                    (
                        (s.timestamp - first.timestamp).num_milliseconds() as f32,
                        kind.primary(s.pitch, s.yaw),
                    )
                })
                .collect();
            let primary_range = range(primary.iter().map(|p| p.1));
            let secondary_range = range(window.iter().map(|s| kind.secondary(s.pitch, s.yaw)));
            // Rest noise and the other gesture never match.
            if primary_range < amp || secondary_range >= primary_range {
                continue;
            }

            let score = ncc(
                &resample(&primary, RESAMPLE_POINTS),
                &resample(&template.primary_series(), RESAMPLE_POINTS),
            );
            if best.map_or(true, |b| score > b) {
                best = Some(score);
            }
        }

        best.filter(|&score| score >= set.confidence_floor)
    }

    /// Derive thresholds from samples captured in a neutral pose.
    pub fn calibrate(&mut self, rest: &[OrientationSample]) -> Result<GestureThresholds, GestureError> {
        let required = self.config.min_calibration_samples;
        if rest.len() < required {
            return Err(GestureError::NotEnoughData {
                samples: rest.len(),
                required,
            });
        }

        let (mean_pitch, std_pitch) = mean_std(rest.iter().map(|s| s.pitch));
        let (mean_yaw, std_yaw) = mean_std(rest.iter().map(|s| s.yaw));
        let k = self.config.calibration_k;
        let clamp = |v: f32| v.clamp(self.config.min_amplitude, self.config.max_amplitude);

        self.thresholds = GestureThresholds {
            pitch_amplitude: clamp(k * std_pitch),
            yaw_amplitude: clamp(k * std_yaw),
            baseline_pitch: mean_pitch,
            baseline_yaw: mean_yaw,
            ..self.thresholds
        };
        self.buffer.clear();

        tracing::info!(
            baseline_pitch = mean_pitch,
            baseline_yaw = mean_yaw,
            pitch_amplitude = self.thresholds.pitch_amplitude,
            yaw_amplitude = self.thresholds.yaw_amplitude,
            "gesture calibration complete"
        );
        Ok(self.thresholds)
    }

    /// Store recorded repetitions as templates of `kind`, replacing any prior
    /// ones, and adapt that axis' amplitude to the user's range of motion.
    pub fn train(
        &mut self,
        kind: GestureKind,
        repetitions: &[Vec<OrientationSample>],
    ) -> Result<TrainingReport, GestureError> {
        let usable: Vec<&Vec<OrientationSample>> = repetitions
            .iter()
            .filter(|rep| rep.len() >= 2)
            .filter(|rep| {
                range(rep.iter().map(|s| kind.primary(s.pitch, s.yaw)))
                    > self.config.min_repetition_range
            })
            .collect();

        let required = self.config.min_repetitions;
        if usable.len() < required {
            return Err(GestureError::NotEnoughRepetitions {
                usable: usable.len(),
                required,
            });
        }

        let templates: Vec<GestureTemplate> = usable
            .iter()
            .map(|rep| GestureTemplate::from_samples(kind, rep, &self.thresholds))
            .collect();

        let resampled: Vec<Vec<f32>> = templates
            .iter()
            .map(|t| resample(&t.primary_series(), RESAMPLE_POINTS))
            .collect();
        let mut pair_scores = Vec::new();
        for i in 0..resampled.len() {
            for j in (i + 1)..resampled.len() {
                pair_scores.push(ncc(&resampled[i], &resampled[j]));
            }
        }
        let mean_pair = pair_scores.iter().sum::<f32>() / pair_scores.len().max(1) as f32;
        let confidence_floor = (mean_pair - FLOOR_MARGIN).clamp(FLOOR_MIN, FLOOR_MAX);

        let mean_range = usable
            .iter()
            .map(|rep| range(rep.iter().map(|s| kind.primary(s.pitch, s.yaw))))
            .sum::<f32>()
            / usable.len() as f32;
        let amplitude = (mean_range * self.config.training_amplitude_ratio)
            .clamp(self.config.min_amplitude, self.config.max_amplitude);
        match kind {
            GestureKind::Nod => self.thresholds.pitch_amplitude = amplitude,
            GestureKind::Shake => self.thresholds.yaw_amplitude = amplitude,
        }

        let repetitions = templates.len();
        self.trained.set(
            kind,
            TemplateSet {
                templates,
                confidence_floor,
            },
        );
        self.buffer.clear();

        tracing::info!(
            gesture = kind.as_str(),
            repetitions,
            confidence_floor,
            amplitude,
            "gesture training complete"
        );
        Ok(TrainingReport {
            kind,
            repetitions,
            confidence_floor,
            amplitude,
        })
    }
}

/// Progress of an interactive training capture.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureProgress {
    Waiting,
    Recording,
    /// A repetition was just captured; carries the running count.
    Captured(usize),
    Complete(Vec<Vec<OrientationSample>>),
}

/// Segments live orientation samples into gesture repetitions: a repetition
/// starts when the primary axis leaves the rest pose and ends once it has
/// rested again for a short while.
#[derive(Debug, Clone)]
pub struct TrainingCapture {
    pub kind: GestureKind,
    pub target: usize,
    pub deadline: Timestamp,
    baseline: f32,
    max_rep: Duration,
    current: Vec<OrientationSample>,
    quiet_since: Option<Timestamp>,
    reps: Vec<Vec<OrientationSample>>,
}

impl TrainingCapture {
    pub fn new(
        kind: GestureKind,
        target: usize,
        thresholds: &GestureThresholds,
        deadline: Timestamp,
    ) -> Self {
        Self {
            kind,
            target,
            deadline,
            baseline: kind.primary(thresholds.baseline_pitch, thresholds.baseline_yaw),
            max_rep: thresholds.window(),
            current: Vec::new(),
            quiet_since: None,
            reps: Vec::new(),
        }
    }

    pub fn captured(&self) -> usize {
        self.reps.len()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.deadline
    }

    pub fn push(&mut self, sample: OrientationSample) -> CaptureProgress {
        let dev = (self.kind.primary(sample.pitch, sample.yaw) - self.baseline).abs();

        if self.current.is_empty() {
            if dev <= CAPTURE_START_DEG {
                return CaptureProgress::Waiting;
            }
            self.current.push(sample);
            return CaptureProgress::Recording;
        }

        self.current.push(sample);
        if dev >= CAPTURE_REST_DEG {
            self.quiet_since = None;
        } else {
            let since = *self.quiet_since.get_or_insert(sample.timestamp);
            if sample.timestamp - since >= Duration::milliseconds(CAPTURE_REST_MS) {
                return self.finish_rep();
            }
        }

        let started = self.current[0].timestamp;
        if sample.timestamp - started > self.max_rep {
            tracing::debug!("training repetition too long; discarded");
            self.current.clear();
            self.quiet_since = None;
            return CaptureProgress::Waiting;
        }
        CaptureProgress::Recording
    }

    fn finish_rep(&mut self) -> CaptureProgress {
        let rep = std::mem::take(&mut self.current);
        self.quiet_since = None;

        let duration = match (rep.first(), rep.last()) {
            (Some(a), Some(b)) => (b.timestamp - a.timestamp).num_milliseconds(),
            _ => 0,
        };
        if duration < CAPTURE_MIN_REP_MS {
            return CaptureProgress::Waiting;
        }

        self.reps.push(rep);
        tracing::info!(
            gesture = self.kind.as_str(),
            captured = self.reps.len(),
            target = self.target,
            "training repetition recorded"
        );
        if self.reps.len() >= self.target {
            CaptureProgress::Complete(std::mem::take(&mut self.reps))
        } else {
            CaptureProgress::Captured(self.reps.len())
        }
    }
}

fn range(values: impl Iterator<Item = f32>) -> f32 {
    let (lo, hi) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo.is_finite() && hi.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

fn mean_std(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let n = values.clone().count().max(1) as f32;
    let mean = values.clone().sum::<f32>() / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// Linearly resample a `(t, value)` series onto `n` evenly spaced points
/// between its first and last timestamps.
fn resample(series: &[(f32, f32)], n: usize) -> Vec<f32> {
    let (Some(&(t0, v0)), Some(&(t1, _))) = (series.first(), series.last()) else {
        return vec![0.0; n];
    };
    if n < 2 || t1 <= t0 {
        return vec![v0; n];
    }

    let mut out = Vec::with_capacity(n);
    let mut seg = 0;
    for i in 0..n {
        let t = t0 + (t1 - t0) * i as f32 / (n - 1) as f32;
        while seg + 2 < series.len() && series[seg + 1].0 < t {
            seg += 1;
        }
        let (ta, va) = series[seg];
        let (tb, vb) = series[(seg + 1).min(series.len() - 1)];
        let v = if tb > ta {
            let f = ((t - ta) / (tb - ta)).clamp(0.0, 1.0);
            va + (vb - va) * f
        } else {
            va
        };
        out.push(v);
    }
    out
}

/// Normalized cross-correlation at zero lag, in [-1, 1].
/// Flat signals have no shape and score 0.
fn ncc(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f32>() / n as f32;
    let mb = b[..n].iter().sum::<f32>() / n as f32;

    let mut num = 0.0f32;
    let mut da = 0.0f32;
    let mut db = 0.0f32;
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        num += (x - ma) * (y - mb);
        da += (x - ma) * (x - ma);
        db += (y - mb) * (y - mb);
    }
    let denom = da.sqrt() * db.sqrt();
    if denom > 1e-6 { num / denom } else { 0.0 }
}
