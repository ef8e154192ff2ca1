//! Market-odds blending.
//!
//! Converts bookmaker odds into margin-removed market probabilities and
//! blends them with the model belief, either through a trained multinomial
//! logistic layer or the adaptive fixed-weight default when no weights
//! have been published.

use tracing::debug;

use crate::model::{BlendWeights, MarketOdds, Outcome, ProbTriple};

/// Margin-removed market view of a fixture.
#[derive(Debug, Clone, Copy)]
pub struct MarketProbs {
    pub probs: ProbTriple,
    /// Bookmaker margin: pre-normalisation implied sum minus one.
    pub overround: f64,
}

/// Remove the bookmaker margin from a 1X2 price triple.
pub fn market_probs(odds: MarketOdds) -> MarketProbs {
    let implied = ProbTriple::new(1.0 / odds.home, 1.0 / odds.draw, 1.0 / odds.away);
    let overround = implied.sum() - 1.0;
    MarketProbs {
        probs: implied.normalised(),
        overround,
    }
}

/// Reconstruct quoted odds from margin-removed probabilities and the
/// retained overround. Inverse of [`market_probs`] up to float noise.
pub fn odds_from_market(market: &MarketProbs) -> MarketOdds {
    let scale = 1.0 + market.overround;
    MarketOdds {
        home: 1.0 / (market.probs.home * scale),
        draw: 1.0 / (market.probs.draw * scale),
        away: 1.0 / (market.probs.away * scale),
    }
}

/// One training row for the blend layer.
#[derive(Debug, Clone, Copy)]
pub struct BlendSample {
    pub model: ProbTriple,
    pub market: ProbTriple,
    pub overround: f64,
    pub league_id: i64,
    pub actual: Outcome,
}

/// Entropy gate of the adaptive default: confident model beliefs keep
/// more of their own mass.
const ADAPTIVE_ENTROPY_GATE: f64 = 0.9;

/// Blend model and market. `None` market passes the model through; with a
/// published weight matrix the logistic layer decides, otherwise the
/// adaptive fixed blend applies.
pub fn blend(
    model: ProbTriple,
    market: Option<&MarketProbs>,
    league_id: i64,
    weights: Option<&BlendWeights>,
) -> ProbTriple {
    let Some(market) = market else {
        return model;
    };
    match weights {
        Some(w) => glm_blend(model, market, league_id, w),
        None => adaptive_blend(model, market),
    }
}

fn adaptive_blend(model: ProbTriple, market: &MarketProbs) -> ProbTriple {
    let alpha = if model.entropy() <= ADAPTIVE_ENTROPY_GATE {
        0.5
    } else {
        0.4
    };
    ProbTriple::new(
        alpha * model.home + (1.0 - alpha) * market.probs.home,
        alpha * model.draw + (1.0 - alpha) * market.probs.draw,
        alpha * model.away + (1.0 - alpha) * market.probs.away,
    )
    .normalised()
}

fn glm_blend(
    model: ProbTriple,
    market: &MarketProbs,
    league_id: i64,
    weights: &BlendWeights,
) -> ProbTriple {
    let x = feature_vector(
        model,
        market.probs,
        market.overround,
        league_id,
        &weights.league_slots,
    );
    if weights.weights.len() != 3 || weights.weights.iter().any(|row| row.len() != x.len()) {
        debug!("blend weights shape mismatch; falling back to adaptive blend");
        return adaptive_blend(model, market);
    }
    let z: Vec<f64> = weights
        .weights
        .iter()
        .map(|row| row.iter().zip(&x).map(|(w, xi)| w * xi).sum())
        .collect();
    softmax3(z[0], z[1], z[2])
}

/// Feature layout: intercept, model triple, market triple, both
/// entropies, overround, league one-hots.
pub fn feature_vector(
    model: ProbTriple,
    market: ProbTriple,
    overround: f64,
    league_id: i64,
    league_slots: &[i64],
) -> Vec<f64> {
    let mut x = vec![
        1.0,
        model.home,
        model.draw,
        model.away,
        market.home,
        market.draw,
        market.away,
        model.entropy(),
        market.entropy(),
        overround,
    ];
    for slot in league_slots {
        x.push(if *slot == league_id { 1.0 } else { 0.0 });
    }
    x
}

fn softmax3(a: f64, b: f64, c: f64) -> ProbTriple {
    let m = a.max(b).max(c);
    let ea = (a - m).exp();
    let eb = (b - m).exp();
    let ec = (c - m).exp();
    let sum = ea + eb + ec;
    ProbTriple::new(ea / sum, eb / sum, ec / sum)
}

/// Fit the multinomial logistic blend by gradient descent with L2
/// shrinkage. Returns `None` when the sample set is too small or
/// degenerate to support a fit.
pub fn fit_blend(
    samples: &[BlendSample],
    max_iters: usize,
    learning_rate: f64,
    l2: f64,
) -> Option<BlendWeights> {
    if samples.len() < 50 {
        return None;
    }
    let mut seen: Vec<Outcome> = Vec::new();
    for s in samples {
        if !seen.contains(&s.actual) {
            seen.push(s.actual);
        }
    }
    if seen.len() < 2 {
        return None;
    }

    let mut league_slots: Vec<i64> = samples.iter().map(|s| s.league_id).collect();
    league_slots.sort_unstable();
    league_slots.dedup();

    let nf = feature_vector(
        ProbTriple::uniform(),
        ProbTriple::uniform(),
        0.0,
        0,
        &league_slots,
    )
    .len();
    let mut w = vec![vec![0.0_f64; nf]; 3];
    let n = samples.len() as f64;

    let rows: Vec<(Vec<f64>, usize)> = samples
        .iter()
        .map(|s| {
            let x = feature_vector(s.model, s.market, s.overround, s.league_id, &league_slots);
            let class = match s.actual {
                Outcome::Home => 0,
                Outcome::Draw => 1,
                Outcome::Away => 2,
            };
            (x, class)
        })
        .collect();

    for i in 0..max_iters.max(1) {
        let lr = learning_rate / (1.0 + 0.01 * i as f64);
        let mut grad = vec![vec![0.0_f64; nf]; 3];

        for (x, class) in &rows {
            let z: Vec<f64> = w
                .iter()
                .map(|row| row.iter().zip(x).map(|(wi, xi)| wi * xi).sum())
                .collect();
            let p = softmax3(z[0], z[1], z[2]);
            let probs = [p.home, p.draw, p.away];
            for (k, pk) in probs.iter().enumerate() {
                let err = pk - if k == *class { 1.0 } else { 0.0 };
                for (g, xi) in grad[k].iter_mut().zip(x) {
                    *g += err * xi;
                }
            }
        }

        for k in 0..3 {
            for j in 0..nf {
                let g = grad[k][j] / n + l2 * w[k][j];
                w[k][j] -= lr * g;
                if !w[k][j].is_finite() {
                    return None;
                }
            }
        }
    }

    Some(BlendWeights {
        weights: w,
        league_slots,
        samples_used: samples.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn odds(h: f64, d: f64, a: f64) -> MarketOdds {
        MarketOdds {
            home: h,
            draw: d,
            away: a,
        }
    }

    #[test]
    fn margin_removal_normalises() {
        let m = market_probs(odds(2.0, 3.4, 3.8));
        assert!(m.overround > 0.0);
        assert_relative_eq!(m.probs.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn odds_round_trip_within_overround() {
        let quoted = odds(1.95, 3.50, 4.10);
        let m = market_probs(quoted);
        let back = odds_from_market(&m);
        assert_relative_eq!(back.home, quoted.home, epsilon = 1e-9);
        assert_relative_eq!(back.draw, quoted.draw, epsilon = 1e-9);
        assert_relative_eq!(back.away, quoted.away, epsilon = 1e-9);
    }

    #[test]
    fn missing_market_passes_model_through() {
        let model = ProbTriple::new(0.5, 0.3, 0.2);
        let out = blend(model, None, 10, None);
        assert_relative_eq!(out.home, model.home);
        assert_relative_eq!(out.draw, model.draw);
    }

    #[test]
    fn adaptive_blend_weights_by_entropy() {
        // Confident model (low entropy): alpha 0.5.
        let confident = ProbTriple::new(0.8, 0.12, 0.08);
        assert!(confident.entropy() <= 0.9);
        let m = market_probs(odds(2.0, 3.4, 3.8));
        let out = blend(confident, Some(&m), 10, None);
        let expected = 0.5 * confident.home + 0.5 * m.probs.home;
        // Components sum to ~1 pre-normalisation, so this holds tightly.
        assert_relative_eq!(out.home, expected, epsilon = 1e-9);

        // Uncertain model: alpha 0.4, market dominates.
        let vague = ProbTriple::uniform();
        assert!(vague.entropy() > 0.9);
        let out = blend(vague, Some(&m), 10, None);
        let expected = 0.4 * vague.home + 0.6 * m.probs.home;
        assert_relative_eq!(out.home, expected, epsilon = 1e-9);
    }

    #[test]
    fn blend_output_is_valid_triple() {
        let m = market_probs(odds(1.6, 4.0, 6.0));
        let out = blend(ProbTriple::new(0.55, 0.25, 0.20), Some(&m), 10, None);
        assert!(out.is_valid());
    }

    #[test]
    fn glm_learns_to_trust_the_market() {
        // Synthetic world where the market is right and the model is noise:
        // outcomes follow the market favourite.
        let mut samples = Vec::new();
        for i in 0..300 {
            let (market, actual) = match i % 3 {
                0 => (ProbTriple::new(0.7, 0.2, 0.1), Outcome::Home),
                1 => (ProbTriple::new(0.15, 0.6, 0.25), Outcome::Draw),
                _ => (ProbTriple::new(0.1, 0.2, 0.7), Outcome::Away),
            };
            samples.push(BlendSample {
                model: ProbTriple::uniform(),
                market,
                overround: 0.05,
                league_id: 10,
                actual,
            });
        }
        let w = fit_blend(&samples, 400, 0.5, 1e-3).expect("fit should succeed");

        let m = MarketProbs {
            probs: ProbTriple::new(0.7, 0.2, 0.1),
            overround: 0.05,
        };
        let out = blend(ProbTriple::uniform(), Some(&m), 10, Some(&w));
        assert_eq!(out.favourite(), Outcome::Home);
        assert!(out.home > 0.45, "home was {}", out.home);
    }

    #[test]
    fn tiny_sample_refuses_to_fit() {
        let samples = vec![
            BlendSample {
                model: ProbTriple::uniform(),
                market: ProbTriple::uniform(),
                overround: 0.05,
                league_id: 10,
                actual: Outcome::Home,
            };
            10
        ];
        assert!(fit_blend(&samples, 100, 0.5, 1e-3).is_none());
    }
}
