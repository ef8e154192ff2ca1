//! Team-strength model: shared vocabulary, fitted parameters, and the
//! atomically published snapshot the request path reads from.

pub mod dixon_coles;
pub mod poisson;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A 1X2 outcome. Stored as "H" / "D" / "A"; the results importer also
/// accepts the "1" / "X" / "2" token family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "H")]
    Home,
    #[serde(rename = "D")]
    Draw,
    #[serde(rename = "A")]
    Away,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Home => "H",
            Outcome::Draw => "D",
            Outcome::Away => "A",
        }
    }

    /// Parse an import token: {1,H} → Home, {X,D} → Draw, {2,A} → Away.
    pub fn parse_token(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "1" | "H" => Ok(Outcome::Home),
            "X" | "D" => Ok(Outcome::Draw),
            "2" | "A" => Ok(Outcome::Away),
            other => Err(EngineError::InvalidInput(format!(
                "unrecognised outcome token '{other}'"
            ))),
        }
    }

    pub fn from_goals(home: i64, away: i64) -> Self {
        if home > away {
            Outcome::Home
        } else if home < away {
            Outcome::Away
        } else {
            Outcome::Draw
        }
    }

    pub const ALL: [Outcome; 3] = [Outcome::Home, Outcome::Draw, Outcome::Away];
}

/// A probability triple over 1X2. Invariant: components in [0,1] summing to
/// 1 within 1e-6 whenever produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbTriple {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

impl ProbTriple {
    pub fn new(home: f64, draw: f64, away: f64) -> Self {
        Self { home, draw, away }
    }

    pub fn uniform() -> Self {
        Self::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
    }

    pub fn get(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Draw => self.draw,
            Outcome::Away => self.away,
        }
    }

    pub fn sum(&self) -> f64 {
        self.home + self.draw + self.away
    }

    /// Rescale so the components sum to exactly 1. Falls back to uniform on
    /// degenerate input rather than dividing by ~0.
    pub fn normalised(&self) -> Self {
        let sum = self.sum();
        if sum <= 1e-12 || !sum.is_finite() {
            return Self::uniform();
        }
        Self::new(self.home / sum, self.draw / sum, self.away / sum)
    }

    /// Shannon entropy in nats. Zero terms contribute nothing.
    pub fn entropy(&self) -> f64 {
        [self.home, self.draw, self.away]
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| -p * p.ln())
            .sum()
    }

    /// The outcome with the highest probability (ties resolve H > D > A).
    pub fn favourite(&self) -> Outcome {
        if self.home >= self.draw && self.home >= self.away {
            Outcome::Home
        } else if self.draw >= self.away {
            Outcome::Draw
        } else {
            Outcome::Away
        }
    }

    pub fn max(&self) -> f64 {
        self.home.max(self.draw).max(self.away)
    }

    pub fn is_valid(&self) -> bool {
        let in_range = [self.home, self.draw, self.away]
            .iter()
            .all(|p| p.is_finite() && (0.0..=1.0).contains(p));
        in_range && (self.sum() - 1.0).abs() < 1e-6
    }
}

/// Decimal 1X2 odds as quoted by the bookmaker. Each strictly > 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

impl MarketOdds {
    pub fn get(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Draw => self.draw,
            Outcome::Away => self.away,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for o in [self.home, self.draw, self.away] {
            if !o.is_finite() || o <= 1.0 {
                return Err(EngineError::InvalidInput(format!(
                    "odds must be finite and > 1.0, got {o}"
                )));
            }
        }
        Ok(())
    }

    /// Default odds applied by the results importer when a fixture carries
    /// none.
    pub fn import_default() -> Self {
        Self {
            home: 2.0,
            draw: 3.0,
            away: 2.5,
        }
    }
}

/// Per-team attack/defence ratings on the log-goal scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TeamStrength {
    pub attack: f64,
    pub defense: f64,
}

impl TeamStrength {
    pub fn neutral() -> Self {
        Self {
            attack: 0.0,
            defense: 0.0,
        }
    }
}

/// League-level overrides produced by the estimator. Values here take
/// precedence over the global parameters when present.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeagueParams {
    pub rho: f64,
    pub home_advantage: f64,
    pub draw_rate: f64,
}

/// Global Dixon–Coles parameters plus the per-league override table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DixonColesParams {
    pub model_version: String,
    pub home_advantage: f64,
    pub rho: f64,
    pub xi: f64,
    pub league_params: HashMap<i64, LeagueParams>,
}

impl DixonColesParams {
    pub fn defaults(model_version: &str, xi: f64) -> Self {
        Self {
            model_version: model_version.to_string(),
            home_advantage: 0.25,
            rho: -0.10,
            xi,
            league_params: HashMap::new(),
        }
    }

    pub fn rho_for(&self, league_id: i64) -> f64 {
        self.league_params
            .get(&league_id)
            .map(|lp| lp.rho)
            .unwrap_or(self.rho)
    }

    pub fn home_advantage_for(&self, league_id: i64) -> f64 {
        self.league_params
            .get(&league_id)
            .map(|lp| lp.home_advantage)
            .unwrap_or(self.home_advantage)
    }
}

/// Multinomial-logistic blend weights trained offline (see
/// `pipeline::blend`). Absent until the training job has published one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendWeights {
    /// One weight row per outcome (H, D, A), each over the feature vector.
    pub weights: Vec<Vec<f64>>,
    /// League ids receiving a one-hot slot, in feature order.
    pub league_slots: Vec<i64>,
    pub samples_used: usize,
}

/// The complete read-side view of model state. A prediction request clones
/// the `Arc` once at entry; training publishes whole new snapshots so a
/// reader never observes a mix of versions.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub params: DixonColesParams,
    pub strengths: HashMap<i64, TeamStrength>,
    pub blend: Option<BlendWeights>,
    pub ev_threshold: f64,
    pub published_at: DateTime<Utc>,
}

impl ModelSnapshot {
    pub fn bootstrap(model_version: &str, xi: f64) -> Self {
        Self {
            params: DixonColesParams::defaults(model_version, xi),
            strengths: HashMap::new(),
            blend: None,
            ev_threshold: 0.0,
            published_at: Utc::now(),
        }
    }

    pub fn strength(&self, team_id: i64) -> Option<TeamStrength> {
        self.strengths.get(&team_id).copied()
    }
}

/// Read-mostly holder for the active snapshot. Writers swap the inner `Arc`
/// whole; readers take a clone and keep it for the duration of the request.
#[derive(Clone)]
pub struct ModelStore {
    inner: Arc<RwLock<Arc<ModelSnapshot>>>,
}

impl ModelStore {
    pub fn new(snapshot: ModelSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn current(&self) -> Arc<ModelSnapshot> {
        self.inner.read().expect("model store poisoned").clone()
    }

    pub fn publish(&self, snapshot: ModelSnapshot) {
        let mut guard = self.inner.write().expect("model store poisoned");
        *guard = Arc::new(snapshot);
    }

    /// Replace only the learned acceptance threshold, keeping the model
    /// parameters untouched.
    pub fn publish_threshold(&self, ev_threshold: f64) {
        let mut guard = self.inner.write().expect("model store poisoned");
        let mut next = (**guard).clone();
        next.ev_threshold = ev_threshold;
        next.published_at = Utc::now();
        *guard = Arc::new(next);
    }
}
