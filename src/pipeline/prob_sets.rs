//! Derivation of the seven canonical probability sets A–G.
//!
//! A closed tag set with a pure reducer per tag; market-dependent sets
//! appear only when the fixture carries odds.

use serde::{Deserialize, Serialize};

use crate::calibration::CalibratorSet;
use crate::error::EngineError;
use crate::model::{BlendWeights, MarketOdds, ProbTriple};
use crate::pipeline::blend::{blend, MarketProbs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetKey {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl SetKey {
    pub const ALL: [SetKey; 7] = [
        SetKey::A,
        SetKey::B,
        SetKey::C,
        SetKey::D,
        SetKey::E,
        SetKey::F,
        SetKey::G,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SetKey::A => "A",
            SetKey::B => "B",
            SetKey::C => "C",
            SetKey::D => "D",
            SetKey::E => "E",
            SetKey::F => "F",
            SetKey::G => "G",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(SetKey::A),
            "B" => Ok(SetKey::B),
            "C" => Ok(SetKey::C),
            "D" => Ok(SetKey::D),
            "E" => Ok(SetKey::E),
            "F" => Ok(SetKey::F),
            "G" => Ok(SetKey::G),
            other => Err(EngineError::InvalidInput(format!(
                "unknown probability set '{other}'"
            ))),
        }
    }
}

/// One derived set for one fixture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DerivedSet {
    pub key: SetKey,
    pub probs: ProbTriple,
    pub entropy: f64,
    /// Kelly fractions per outcome, surfaced only on set F.
    pub kelly: Option<[f64; 3]>,
}

/// All sets derivable for one fixture. Market-dependent entries are `None`
/// without odds.
#[derive(Debug, Clone, Default)]
pub struct SetBundle {
    sets: Vec<DerivedSet>,
}

impl SetBundle {
    pub fn get(&self, key: SetKey) -> Option<&DerivedSet> {
        self.sets.iter().find(|s| s.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedSet> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Inverse-Brier ensemble weights for sets A, B, C; uniform until the
/// evaluation window has history.
#[derive(Debug, Clone, Copy)]
pub struct EnsembleWeights {
    pub brier_a: f64,
    pub brier_b: f64,
    pub brier_c: f64,
}

impl EnsembleWeights {
    fn normalised(&self) -> (f64, f64, f64) {
        let inv = |b: f64| 1.0 / b.max(1e-6);
        let (wa, wb, wc) = (inv(self.brier_a), inv(self.brier_b), inv(self.brier_c));
        let sum = wa + wb + wc;
        (wa / sum, wb / sum, wc / sum)
    }
}

impl Default for EnsembleWeights {
    /// Equal Brier means equal weights.
    fn default() -> Self {
        Self {
            brier_a: 1.0,
            brier_b: 1.0,
            brier_c: 1.0,
        }
    }
}

/// Derive every applicable set for one fixture.
///
/// `draw_adjusted` is the post-structural-adjustment model belief; sets
/// are calibrated through `calibrators` after their defining transform.
pub fn derive_sets(
    draw_adjusted: ProbTriple,
    market: Option<&MarketProbs>,
    odds: Option<MarketOdds>,
    league_id: i64,
    blend_weights: Option<&BlendWeights>,
    calibrators: &CalibratorSet,
    ensemble: EnsembleWeights,
) -> SetBundle {
    let mut sets = Vec::with_capacity(7);

    // A: the pure model path, calibrated.
    let a = calibrators.apply(draw_adjusted);
    sets.push(make(SetKey::A, a, None));

    let Some(market) = market else {
        return SetBundle { sets };
    };

    // B: model/market blend, calibrated.
    let b = calibrators.apply(blend(draw_adjusted, Some(market), league_id, blend_weights));
    sets.push(make(SetKey::B, b, None));

    // C: market-dominant mix, calibrated.
    let c_raw = ProbTriple::new(
        0.2 * draw_adjusted.home + 0.8 * market.probs.home,
        0.2 * draw_adjusted.draw + 0.8 * market.probs.draw,
        0.2 * draw_adjusted.away + 0.8 * market.probs.away,
    )
    .normalised();
    let c = calibrators.apply(c_raw);
    sets.push(make(SetKey::C, c, None));

    // D: draw-boosted view of B.
    let d = ProbTriple::new(b.home, 1.15 * b.draw, b.away).normalised();
    sets.push(make(SetKey::D, d, None));

    // E: entropy-penalised B (logits sharpened by 1.5).
    sets.push(make(SetKey::E, sharpen(b, 1.5), None));

    // F: B with per-pick Kelly fractions surfaced; probabilities untouched.
    if let Some(odds) = odds {
        let kelly = [
            kelly_fraction(b.home, odds.home),
            kelly_fraction(b.draw, odds.draw),
            kelly_fraction(b.away, odds.away),
        ];
        sets.push(make(SetKey::F, b, Some(kelly)));
    }

    // G: inverse-Brier ensemble of A, B, C.
    let (wa, wb, wc) = ensemble.normalised();
    let g = ProbTriple::new(
        wa * a.home + wb * b.home + wc * c.home,
        wa * a.draw + wb * b.draw + wc * c.draw,
        wa * a.away + wb * b.away + wc * c.away,
    )
    .normalised();
    sets.push(make(SetKey::G, g, None));

    SetBundle { sets }
}

fn make(key: SetKey, probs: ProbTriple, kelly: Option<[f64; 3]>) -> DerivedSet {
    DerivedSet {
        key,
        probs,
        entropy: probs.entropy(),
        kelly,
    }
}

/// Kelly fraction `(p*o - 1)/(o - 1)`, floored at zero when there is no
/// edge.
pub fn kelly_fraction(p: f64, odds: f64) -> f64 {
    if odds <= 1.0 {
        return 0.0;
    }
    ((p * odds - 1.0) / (odds - 1.0)).max(0.0)
}

/// Softmax of the scaled log-odds of each component: gamma > 1 sharpens
/// the distribution toward its favourite.
fn sharpen(p: ProbTriple, gamma: f64) -> ProbTriple {
    const EPS: f64 = 1e-9;
    let logit = |v: f64| {
        let v = v.clamp(EPS, 1.0 - EPS);
        (v / (1.0 - v)).ln()
    };
    let z = [
        logit(p.home) * gamma,
        logit(p.draw) * gamma,
        logit(p.away) * gamma,
    ];
    let m = z[0].max(z[1]).max(z[2]);
    let e: Vec<f64> = z.iter().map(|v| (v - m).exp()).collect();
    let sum: f64 = e.iter().sum();
    ProbTriple::new(e[0] / sum, e[1] / sum, e[2] / sum)
}
