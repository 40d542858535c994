use serde::Serialize;

/// Probability at or above which the classifier output counts as `normal`.
pub const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Covid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Probabilities {
    pub covid: f64,
    pub normal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_class: Label,
    pub confidence: f64,
    pub probabilities: Probabilities,
}

impl Prediction {
    /// Maps the sigmoid output `p` (probability of `normal`) to a label.
    pub fn from_probability(p: f64) -> Self {
        let (predicted_class, confidence) = if p < DECISION_THRESHOLD {
            (Label::Covid, 1.0 - p)
        } else {
            (Label::Normal, p)
        };

        Self {
            predicted_class,
            confidence,
            probabilities: Probabilities {
                covid: round_percent((1.0 - p) * 100.0),
                normal: round_percent(p * 100.0),
            },
        }
    }
}

fn round_percent(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub filename: Option<String>,
    #[serde(flatten)]
    pub prediction: Prediction,
}
