//! Base 1X2 probability generation from fitted team strengths.
//!
//! Enumerates the 0..8 score grid under independent Poissons with the
//! Dixon–Coles low-score correction, gated so the correction only applies
//! to genuinely low-scoring fixtures.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::dixon_coles::tau;
use crate::model::{DixonColesParams, ProbTriple, TeamStrength};

/// Score grid upper bound; 0..=8 covers >99.9% of the goal mass for any
/// supported lambda.
const MAX_GOALS: u32 = 8;

/// Apply the low-score correction only below this combined expected-goal
/// level; above it the grid uses plain independent Poissons.
const DC_GATE_TOTAL_LAMBDA: f64 = 2.4;

const XG_CONFIDENCE_EPS: f64 = 0.01;

/// The model's belief about a fixture before any structural or market
/// adjustment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseProbability {
    pub fixture_id: i64,
    pub probs: ProbTriple,
    pub lambda_home: f64,
    pub lambda_away: f64,
    pub xg_home: f64,
    pub xg_away: f64,
    pub xg_confidence: f64,
    pub dc_applied: bool,
}

/// Expected goals for a fixture: league home advantage when fitted,
/// global otherwise.
pub fn expected_goals(
    home: TeamStrength,
    away: TeamStrength,
    params: &DixonColesParams,
    league_id: i64,
) -> (f64, f64) {
    let home_adv = params.home_advantage_for(league_id);
    let lambda_h = (home_adv + home.attack - away.defense).exp();
    let lambda_a = (away.attack - home.defense).exp();
    (lambda_h, lambda_a)
}

/// Compute the base probability triple for a fixture.
pub fn base_probability(
    fixture_id: i64,
    home: TeamStrength,
    away: TeamStrength,
    params: &DixonColesParams,
    league_id: i64,
) -> EngineResult<BaseProbability> {
    let (lambda_h, lambda_a) = expected_goals(home, away, params, league_id);
    from_lambdas(fixture_id, lambda_h, lambda_a, params.rho_for(league_id))
}

/// Grid aggregation from explicit lambdas. Split out so serving and tests
/// can drive it directly.
pub fn from_lambdas(
    fixture_id: i64,
    lambda_h: f64,
    lambda_a: f64,
    rho: f64,
) -> EngineResult<BaseProbability> {
    for l in [lambda_h, lambda_a] {
        if !l.is_finite() || !(0.01..=10.0).contains(&l) {
            return Err(EngineError::InvalidLambda {
                fixture_id,
                lambda_home: lambda_h,
                lambda_away: lambda_a,
            });
        }
    }

    let dc_applied = lambda_h + lambda_a < DC_GATE_TOTAL_LAMBDA;

    let pmf_h = poisson_pmf(lambda_h);
    let pmf_a = poisson_pmf(lambda_a);

    let mut p_home = 0.0_f64;
    let mut p_draw = 0.0_f64;
    let mut p_away = 0.0_f64;

    for x in 0..=MAX_GOALS {
        for y in 0..=MAX_GOALS {
            let correction = if dc_applied {
                tau(x, y, lambda_h, lambda_a, rho)
            } else {
                1.0
            };
            let p = (pmf_h[x as usize] * pmf_a[y as usize] * correction).max(0.0);
            if x > y {
                p_home += p;
            } else if x == y {
                p_draw += p;
            } else {
                p_away += p;
            }
        }
    }

    // The tail beyond the grid is redistributed proportionally.
    let probs = ProbTriple::new(p_home, p_draw, p_away).normalised();

    let xg_confidence = (1.0
        - (lambda_h - lambda_a).abs() / (lambda_h + lambda_a + XG_CONFIDENCE_EPS))
        .clamp(0.1, 1.0);

    Ok(BaseProbability {
        fixture_id,
        probs,
        lambda_home: lambda_h,
        lambda_away: lambda_a,
        xg_home: lambda_h,
        xg_away: lambda_a,
        xg_confidence,
        dc_applied,
    })
}

fn poisson_pmf(lambda: f64) -> [f64; (MAX_GOALS + 1) as usize] {
    let mut out = [0.0_f64; (MAX_GOALS + 1) as usize];
    out[0] = (-lambda).exp();
    for k in 1..out.len() {
        out[k] = out[k - 1] * lambda / k as f64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pure_draw_scenario_boosts_draw() {
        // lambda_h == lambda_a == 1.1 with rho = -0.13: symmetric fixture,
        // DC gate active (total 2.2 < 2.4).
        let base = from_lambdas(1, 1.1, 1.1, -0.13).unwrap();
        assert!(base.dc_applied);
        assert_relative_eq!(base.probs.home, base.probs.away, epsilon = 1e-9);
        assert!(base.probs.draw > 0.27, "draw was {}", base.probs.draw);
        assert!(base.probs.is_valid());
    }

    #[test]
    fn high_scoring_scenario_disables_dc() {
        let base = from_lambdas(2, 2.0, 2.1, -0.13).unwrap();
        assert!(!base.dc_applied);
        assert!(base.probs.draw < 0.23, "draw was {}", base.probs.draw);
        assert!(base.probs.is_valid());
    }

    #[test]
    fn grid_tail_is_renormalised() {
        let base = from_lambdas(3, 4.0, 4.0, -0.13).unwrap();
        assert_relative_eq!(base.probs.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn xg_confidence_bounds() {
        let even = from_lambdas(4, 1.4, 1.4, -0.1).unwrap();
        assert_relative_eq!(even.xg_confidence, 1.0, epsilon = 1e-9);

        // 1 - 5.95/6.06 is ~0.018, clipped up to the floor.
        let lopsided = from_lambdas(5, 6.0, 0.05, -0.1).unwrap();
        assert_relative_eq!(lopsided.xg_confidence, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn invalid_lambda_is_rejected() {
        assert!(matches!(
            from_lambdas(6, 0.001, 1.0, -0.1),
            Err(EngineError::InvalidLambda { .. })
        ));
        assert!(matches!(
            from_lambdas(7, 1.0, 12.0, -0.1),
            Err(EngineError::InvalidLambda { .. })
        ));
        assert!(matches!(
            from_lambdas(8, f64::NAN, 1.0, -0.1),
            Err(EngineError::InvalidLambda { .. })
        ));
    }

    #[test]
    fn stronger_home_side_is_favoured() {
        let base = from_lambdas(9, 2.2, 0.9, -0.1).unwrap();
        assert!(base.probs.home > base.probs.away);
        assert!(base.probs.home > 0.5);
    }
}
