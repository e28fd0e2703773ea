//! Momentum scoring over recent history and intra-round flow.
//!
//! Pure functions: the aggregator owns the state, this module turns a
//! snapshot of it into a prediction with confidence and reasons.

use crate::model::Direction;
use crate::store::RoundFeature;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Streak window over the most recent results.
const STREAK_WINDOW: usize = 3;

/// Flow deviation that earns the dominant side two points.
const DIFF_THRESHOLD: f64 = 0.10;

/// Volume ratio bucket edges.
pub const VOLUME_MID_EDGE: f64 = 1.2;
pub const VOLUME_HIGH_EDGE: f64 = 1.5;

/// Quiet-then-breakout: price-change stddev below this with a recent move
/// above the breakout threshold scores two points.
const BREAKOUT_SIGMA: f64 = 0.01;
const BREAKOUT_MOVE: f64 = 0.02;

/// Regression slope (per second) that adds a confidence point.
const SLOPE_CONFIDENCE_EDGE: f64 = 0.04;

/// Thin-round downgrade edge as a fraction of average volume.
const THIN_VOLUME_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            other => Err(format!("unknown confidence: {other}")),
        }
    }
}

impl Confidence {
    fn downgrade(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            _ => Confidence::Low,
        }
    }

    /// The final revision never goes out at low confidence.
    pub fn final_lift(self) -> Self {
        match self {
            Confidence::Low => Confidence::Medium,
            other => other,
        }
    }
}

/// Intra-round flow snapshot at scoring time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowFeatures {
    pub up_ratio: f64,
    pub up_ratio_diff: f64,
    pub volume_ratio: f64,
    pub slope: f64,
}

/// The scored momentum strategy output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumSignal {
    pub prediction: Direction,
    pub confidence: Confidence,
    /// Net score: positive favours UP.
    pub score: i32,
    pub reasons: Vec<String>,
    pub features: FlowFeatures,
}

/// Volume bucket used by the emission trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeBucket {
    Base,
    Mid,
    High,
}

pub fn volume_bucket(volume_ratio: f64) -> VolumeBucket {
    if volume_ratio >= VOLUME_HIGH_EDGE {
        VolumeBucket::High
    } else if volume_ratio >= VOLUME_MID_EDGE {
        VolumeBucket::Mid
    } else {
        VolumeBucket::Base
    }
}

/// Least-squares slope of (t, up_ratio) points, in ratio units per
/// second. Points are (unix millis, ratio).
pub fn regression_slope(points: &[(i64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let t0 = points[0].0;
    let xs: Vec<f64> = points.iter().map(|(t, _)| (*t - t0) as f64 / 1000.0).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| *y).sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (x, (_, y)) in xs.iter().zip(points.iter()) {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Score a round given the last finalized rounds (newest first) and the
/// current flow. Fewer than three historical rounds falls back to the
/// flow ratio alone.
pub fn score(
    history: &[RoundFeature],
    features: FlowFeatures,
    total: Decimal,
    avg_volume: Decimal,
) -> MomentumSignal {
    if history.len() < STREAK_WINDOW {
        let prediction = if features.up_ratio >= 0.5 {
            Direction::Up
        } else {
            Direction::Down
        };
        return MomentumSignal {
            prediction,
            confidence: Confidence::Low,
            score: 0,
            reasons: vec!["insufficient history, flow-ratio fallback".to_string()],
            features,
        };
    }

    let mut up = 0i32;
    let mut down = 0i32;
    let mut reasons = Vec::new();

    // Streak: a full run of one side predicts reversal, a majority
    // predicts continuation.
    let recent = &history[..STREAK_WINDOW.min(history.len())];
    let up_results = recent.iter().filter(|r| r.result_up).count();
    let down_results = recent.len() - up_results;
    if up_results >= STREAK_WINDOW {
        down += 2;
        reasons.push("UP streak, expecting reversal".to_string());
    } else if up_results == STREAK_WINDOW - 1 {
        up += 1;
        reasons.push("UP majority in recent rounds".to_string());
    }
    if down_results >= STREAK_WINDOW {
        up += 2;
        reasons.push("DOWN streak, expecting reversal".to_string());
    } else if down_results == STREAK_WINDOW - 1 {
        down += 1;
        reasons.push("DOWN majority in recent rounds".to_string());
    }

    // Flow deviation from the historical mean.
    if features.up_ratio_diff.abs() > DIFF_THRESHOLD {
        if features.up_ratio_diff > 0.0 {
            up += 2;
            reasons.push(format!(
                "flow {:.2} above historical mean",
                features.up_ratio_diff
            ));
        } else {
            down += 2;
            reasons.push(format!(
                "flow {:.2} below historical mean",
                features.up_ratio_diff
            ));
        }
    }

    // Heavy volume confirms a one-sided book.
    if features.volume_ratio > VOLUME_HIGH_EDGE {
        if features.up_ratio > 0.6 {
            up += 1;
            reasons.push("heavy volume on UP-leaning book".to_string());
        } else if features.up_ratio < 0.4 {
            down += 1;
            reasons.push("heavy volume on DOWN-leaning book".to_string());
        }
    }

    // Quiet regime then a breakout move.
    let changes: Vec<f64> = history.iter().map(|r| r.price_change).collect();
    let sigma = stddev(&changes);
    let latest_change = history.first().map(|r| r.price_change).unwrap_or(0.0);
    if sigma < BREAKOUT_SIGMA && latest_change.abs() > BREAKOUT_MOVE {
        if latest_change > 0.0 {
            up += 2;
            reasons.push("price breakout up from quiet regime".to_string());
        } else {
            down += 2;
            reasons.push("price breakout down from quiet regime".to_string());
        }
    }

    let net = up - down;
    let prediction = match net.cmp(&0) {
        std::cmp::Ordering::Greater => Direction::Up,
        std::cmp::Ordering::Less => Direction::Down,
        std::cmp::Ordering::Equal => {
            reasons.push("score tie, following flow ratio".to_string());
            if features.up_ratio >= 0.5 {
                Direction::Up
            } else {
                Direction::Down
            }
        }
    };

    let confidence = confidence(&features, total, avg_volume);

    MomentumSignal {
        prediction,
        confidence,
        score: net,
        reasons,
        features,
    }
}

/// Confidence ladder: points for strong deviation, heavy volume, and a
/// steep flow slope; high at three points; thin rounds downgrade a notch.
fn confidence(features: &FlowFeatures, total: Decimal, avg_volume: Decimal) -> Confidence {
    let mut points = 0i32;
    if features.up_ratio_diff.abs() > DIFF_THRESHOLD {
        points += 2;
    }
    if features.volume_ratio >= VOLUME_HIGH_EDGE {
        points += 2;
    } else if features.volume_ratio >= VOLUME_MID_EDGE {
        points += 1;
    }
    if features.slope > SLOPE_CONFIDENCE_EDGE {
        points += 1;
    }

    let mut level = if points >= 3 {
        Confidence::High
    } else {
        Confidence::Medium
    };

    let thin = avg_volume > Decimal::ZERO
        && total.to_f64().unwrap_or(0.0)
            < THIN_VOLUME_FRACTION * avg_volume.to_f64().unwrap_or(0.0);
    if thin {
        level = level.downgrade();
    }
    level
}

fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn feature(result_up: bool, price_change: f64) -> RoundFeature {
        RoundFeature {
            epoch: 0,
            up_ratio: 0.5,
            price_change,
            total_amount: dec!(5),
            result_up,
        }
    }

    fn flow(up_ratio: f64, diff: f64, volume_ratio: f64, slope: f64) -> FlowFeatures {
        FlowFeatures {
            up_ratio,
            up_ratio_diff: diff,
            volume_ratio,
            slope,
        }
    }

    #[test]
    fn short_history_falls_back_to_flow() {
        let history = vec![feature(true, 0.01)];
        let signal = score(&history, flow(0.62, 0.0, 1.0, 0.0), dec!(5), dec!(5));
        assert_eq!(signal.prediction, Direction::Up);
        assert_eq!(signal.confidence, Confidence::Low);
        assert_eq!(signal.score, 0);

        let signal = score(&history, flow(0.4, 0.0, 1.0, 0.0), dec!(5), dec!(5));
        assert_eq!(signal.prediction, Direction::Down);
    }

    #[test]
    fn up_streak_scores_reversal() {
        let history = vec![
            feature(true, 0.005),
            feature(true, 0.004),
            feature(true, 0.006),
            feature(false, 0.002),
            feature(true, 0.003),
        ];
        let signal = score(&history, flow(0.5, 0.0, 1.0, 0.0), dec!(5), dec!(5));
        assert_eq!(signal.prediction, Direction::Down);
        assert_eq!(signal.score, -2);
    }

    #[test]
    fn majority_scores_continuation() {
        let history = vec![
            feature(true, 0.005),
            feature(true, 0.004),
            feature(false, 0.006),
        ];
        // up majority (+1 up) and down minority (nothing)
        let signal = score(&history, flow(0.5, 0.0, 1.0, 0.0), dec!(5), dec!(5));
        assert_eq!(signal.prediction, Direction::Up);
        assert_eq!(signal.score, 1);
    }

    #[test]
    fn flow_deviation_dominates() {
        let history = vec![
            feature(true, 0.005),
            feature(false, 0.004),
            feature(true, 0.006),
        ];
        // streak window: 2 up → up += 1; diff -0.2 → down += 2
        let signal = score(&history, flow(0.3, -0.2, 1.0, 0.0), dec!(5), dec!(5));
        assert_eq!(signal.prediction, Direction::Down);
        assert_eq!(signal.score, -1);
    }

    #[test]
    fn breakout_from_quiet_regime() {
        let history = vec![
            feature(false, 0.025),
            feature(true, 0.001),
            feature(false, 0.002),
            feature(true, 0.001),
            feature(true, 0.002),
        ];
        // sigma of changes is small, newest |change| = 0.025 > 0.02
        let signal = score(&history, flow(0.5, 0.0, 1.0, 0.0), dec!(5), dec!(5));
        assert!(signal
            .reasons
            .iter()
            .any(|r| r.contains("breakout up")));
    }

    #[test]
    fn tie_breaks_on_flow_ratio() {
        let history = vec![
            feature(true, 0.005),
            feature(true, 0.004),
            feature(false, 0.006),
        ];
        // UP majority (+1 up) against a DOWN-leaning heavy book (+1 down)
        let tied = score(&history, flow(0.3, 0.0, 1.6, 0.0), dec!(5), dec!(5));
        assert_eq!(tied.score, 0);
        assert_eq!(tied.prediction, Direction::Down);
        assert!(tied.reasons.iter().any(|r| r.contains("tie")));

    }

    #[test]
    fn confidence_ladder() {
        // strong deviation + high volume → high
        let c = confidence(&flow(0.7, 0.2, 1.6, 0.0), dec!(5), dec!(5));
        assert_eq!(c, Confidence::High);
        // mid volume only → medium
        let c = confidence(&flow(0.5, 0.0, 1.3, 0.0), dec!(5), dec!(5));
        assert_eq!(c, Confidence::Medium);
        // thin round downgrades high to medium
        let c = confidence(&flow(0.7, 0.2, 1.6, 0.0), dec!(0.5), dec!(5));
        assert_eq!(c, Confidence::Medium);
        // thin round downgrades medium to low
        let c = confidence(&flow(0.5, 0.0, 1.0, 0.0), dec!(0.5), dec!(5));
        assert_eq!(c, Confidence::Low);
    }

    #[test]
    fn final_lift_raises_low_only() {
        assert_eq!(Confidence::Low.final_lift(), Confidence::Medium);
        assert_eq!(Confidence::Medium.final_lift(), Confidence::Medium);
        assert_eq!(Confidence::High.final_lift(), Confidence::High);
    }

    #[test]
    fn slope_of_linear_series() {
        // ratio climbing 0.05 per second
        let points: Vec<(i64, f64)> = (0..8)
            .map(|i| (1_700_000_000_000 + i * 1000, 0.4 + 0.05 * i as f64))
            .collect();
        let slope = regression_slope(&points);
        assert!((slope - 0.05).abs() < 1e-9);
    }

    #[test]
    fn volume_buckets() {
        assert_eq!(volume_bucket(0.9), VolumeBucket::Base);
        assert_eq!(volume_bucket(1.2), VolumeBucket::Mid);
        assert_eq!(volume_bucket(1.49), VolumeBucket::Mid);
        assert_eq!(volume_bucket(1.5), VolumeBucket::High);
    }
}
