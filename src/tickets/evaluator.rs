//! Decision-intelligence evaluation.
//!
//! Scores a candidate ticket pick by pick: expected value weighted by the
//! fixture's xG confidence, minus structural penalties. Hard
//! contradictions collapse the score to negative infinity and reject the
//! ticket outright.

use crate::db::models::ScoredOutcome;
use crate::model::Outcome;
use crate::tickets::{expected_value, SlateFixture};

/// Acceptance-rate window the threshold learner must stay inside.
pub const ACCEPTANCE_BOUNDS: (f64, f64) = (0.55, 0.80);
/// Minimum settled tickets before a learned threshold is trusted.
const MIN_LEARNING_SAMPLES: usize = 50;

#[derive(Debug, Clone)]
pub struct PickAssessment {
    pub fixture_id: i64,
    pub pick: Outcome,
    pub probability: f64,
    pub odds: f64,
    pub ev: f64,
    pub penalty: f64,
    pub contradiction: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TicketEvaluation {
    pub ev_score: f64,
    pub contradictions: i64,
    pub accepted: bool,
    pub reason: String,
    pub picks: Vec<PickAssessment>,
}

/// Evaluate one candidate against the slate under the target set.
pub fn evaluate(
    picks: &[Outcome],
    slate: &[SlateFixture],
    ev_threshold: f64,
    max_contradictions: i64,
) -> TicketEvaluation {
    debug_assert_eq!(picks.len(), slate.len());

    let mut assessments = Vec::with_capacity(picks.len());
    let mut score = 0.0_f64;
    let mut contradictions = 0i64;

    for (pick, fixture) in picks.iter().zip(slate) {
        let assessment = assess_pick(*pick, fixture);
        if assessment.contradiction.is_some() {
            contradictions += 1;
        }
        score += assessment.ev * fixture.xg_confidence - assessment.penalty;
        assessments.push(assessment);
    }

    if contradictions > 0 {
        let reason = assessments
            .iter()
            .find_map(|a| a.contradiction.clone())
            .unwrap_or_else(|| "contradiction".into());
        return TicketEvaluation {
            ev_score: f64::NEG_INFINITY,
            contradictions,
            accepted: false,
            reason,
            picks: assessments,
        };
    }

    let accepted = score >= ev_threshold && contradictions <= max_contradictions;
    let reason = if accepted {
        "accepted".to_string()
    } else {
        format!("score {score:.3} below threshold {ev_threshold:.3}")
    };
    TicketEvaluation {
        ev_score: score,
        contradictions,
        accepted,
        reason,
        picks: assessments,
    }
}

fn assess_pick(pick: Outcome, f: &SlateFixture) -> PickAssessment {
    let odds = f.effective_odds();
    let o = odds.get(pick);
    let p = f.probs.get(pick);
    let ev = expected_value(p, o);
    let xg_gap = (f.xg_home - f.xg_away).abs();

    let mut contradiction = None;
    match pick {
        Outcome::Draw => {
            if f.probs.home >= 0.55 {
                contradiction = Some(format!(
                    "draw pick against home dominance (p_home {:.2}) on fixture {}",
                    f.probs.home, f.fixture_id
                ));
            } else if xg_gap >= 0.9 {
                contradiction = Some(format!(
                    "draw pick with xg gap {:.2} on fixture {}",
                    xg_gap, f.fixture_id
                ));
            }
        }
        Outcome::Away => {
            if o >= 4.5 && p < 0.20 {
                contradiction = Some(format!(
                    "long-shot away at odds {:.2} with p {:.2} on fixture {}",
                    o, p, f.fixture_id
                ));
            }
        }
        Outcome::Home => {}
    }

    let mut market_gap = None;
    if let Some(market) = f.market {
        let gap = (p - market.get(pick)).abs();
        market_gap = Some(gap);
        if contradiction.is_none() && gap > 0.25 && pick != market.favourite() {
            contradiction = Some(format!(
                "extreme market disagreement ({:.2}) on non-favourite pick, fixture {}",
                gap, f.fixture_id
            ));
        }
    }

    let mut penalty = 0.0;
    if pick == Outcome::Draw && odds.draw > 4.0 {
        penalty += 0.15;
    }
    if pick == Outcome::Draw && xg_gap > 0.5 {
        penalty += 0.15;
    }
    if pick == Outcome::Away && odds.away > 3.0 {
        penalty += 0.10;
    }
    if let Some(gap) = market_gap {
        penalty += if gap < 0.05 {
            0.0
        } else if gap < 0.10 {
            0.05
        } else if gap < 0.20 {
            0.15
        } else {
            0.30
        };
    }

    PickAssessment {
        fixture_id: f.fixture_id,
        pick,
        probability: p,
        odds: o,
        ev,
        penalty,
        contradiction,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdLearning {
    pub ev_threshold: f64,
    pub acceptance_rate: f64,
    pub samples: usize,
}

/// Learn the acceptance threshold from settled tickets: the candidate
/// maximising hit-rate lift over baseline while keeping the acceptance
/// rate inside [`ACCEPTANCE_BOUNDS`].
pub fn learn_threshold(scored: &[ScoredOutcome]) -> Option<ThresholdLearning> {
    if scored.len() < MIN_LEARNING_SAMPLES {
        return None;
    }
    let hit_rate = |s: &ScoredOutcome| {
        if s.total_picks > 0 {
            s.hits as f64 / s.total_picks as f64
        } else {
            0.0
        }
    };
    let n = scored.len() as f64;
    let baseline: f64 = scored.iter().map(hit_rate).sum::<f64>() / n;

    let mut candidates: Vec<f64> = scored.iter().map(|s| s.ev_score).collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    candidates.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

    let (lo, hi) = ACCEPTANCE_BOUNDS;
    let mut best: Option<(f64, f64, f64)> = None; // (lift, threshold, acceptance)
    for threshold in candidates {
        let accepted: Vec<&ScoredOutcome> = scored
            .iter()
            .filter(|s| s.ev_score >= threshold)
            .collect();
        let acceptance = accepted.len() as f64 / n;
        if acceptance < lo || acceptance > hi {
            continue;
        }
        let mean: f64 =
            accepted.iter().map(|s| hit_rate(s)).sum::<f64>() / accepted.len() as f64;
        let lift = mean - baseline;
        let better = match best {
            None => true,
            Some((best_lift, _, _)) => lift > best_lift + 1e-12,
        };
        if better {
            best = Some((lift, threshold, acceptance));
        }
    }

    best.map(|(_, ev_threshold, acceptance_rate)| ThresholdLearning {
        ev_threshold,
        acceptance_rate,
        samples: scored.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketOdds, ProbTriple};
    use crate::tickets::testkit::slate_fixture;
    use approx::assert_relative_eq;

    #[test]
    fn draw_against_home_dominance_is_a_hard_reject() {
        // Scenario: p_home 0.62, draw pick.
        let f = slate_fixture(
            1,
            ProbTriple::new(0.62, 0.22, 0.16),
            Some(MarketOdds {
                home: 1.6,
                draw: 3.9,
                away: 5.5,
            }),
        );
        let eval = evaluate(&[Outcome::Draw], &[f], 0.0, 0);
        assert!(!eval.accepted);
        assert_eq!(eval.contradictions, 1);
        assert_eq!(eval.ev_score, f64::NEG_INFINITY);
        assert!(eval.reason.contains("home dominance"));
    }

    #[test]
    fn draw_with_wide_xg_gap_is_rejected() {
        let mut f = slate_fixture(
            2,
            ProbTriple::new(0.45, 0.30, 0.25),
            Some(MarketOdds {
                home: 2.1,
                draw: 3.3,
                away: 3.5,
            }),
        );
        f.xg_home = 2.3;
        f.xg_away = 1.1;
        let eval = evaluate(&[Outcome::Draw], &[f], 0.0, 0);
        assert!(!eval.accepted);
        assert!(eval.reason.contains("xg gap"));
    }

    #[test]
    fn longshot_away_is_rejected() {
        let f = slate_fixture(
            3,
            ProbTriple::new(0.60, 0.25, 0.15),
            Some(MarketOdds {
                home: 1.55,
                draw: 4.0,
                away: 6.0,
            }),
        );
        let eval = evaluate(&[Outcome::Away], &[f], 0.0, 0);
        assert!(!eval.accepted);
        assert!(eval.reason.contains("long-shot"));
    }

    #[test]
    fn market_disagreement_rejects_non_favourite_pick() {
        // Model loves the away side; market prices it a rank outsider.
        let mut f = slate_fixture(
            4,
            ProbTriple::new(0.30, 0.20, 0.50),
            Some(MarketOdds {
                home: 1.45,
                draw: 4.2,
                away: 4.4,
            }),
        );
        // Keep the away-longshot rule out of the way: p >= 0.20, odds < 4.5.
        f.xg_home = 1.4;
        f.xg_away = 1.3;
        let eval = evaluate(&[Outcome::Away], &[f], 0.0, 0);
        assert!(!eval.accepted);
        assert!(eval.reason.contains("market disagreement"));
    }

    #[test]
    fn clean_favourite_ticket_is_accepted() {
        let f = slate_fixture(
            5,
            ProbTriple::new(0.62, 0.22, 0.16),
            Some(MarketOdds {
                home: 1.75,
                draw: 3.6,
                away: 4.8,
            }),
        );
        // p=0.62 at 1.75: ev = 0.62*0.75 - 0.38 = 0.085.
        let eval = evaluate(&[Outcome::Home], &[f], 0.0, 0);
        assert!(eval.accepted, "reason: {}", eval.reason);
        assert!(eval.ev_score > 0.0);
        assert_eq!(eval.contradictions, 0);
    }

    #[test]
    fn penalties_deduct_without_rejecting() {
        // Draw at long odds with a moderate xg gap: two penalties, no
        // contradiction.
        let mut f = slate_fixture(
            6,
            ProbTriple::new(0.40, 0.32, 0.28),
            Some(MarketOdds {
                home: 2.4,
                draw: 4.2,
                away: 3.2,
            }),
        );
        f.xg_home = 1.8;
        f.xg_away = 1.2; // gap 0.6: penalty, below the 0.9 contradiction
        f.market = Some(ProbTriple::new(0.40, 0.31, 0.29));
        let eval = evaluate(&[Outcome::Draw], &[f], -10.0, 0);
        assert_eq!(eval.contradictions, 0);
        assert!(eval.accepted);
        let a = &eval.picks[0];
        // 0.15 (odds > 4.0) + 0.15 (gap > 0.5), market gap ~0.01 adds 0.
        assert_relative_eq!(a.penalty, 0.30, epsilon = 1e-9);
    }

    #[test]
    fn ev_is_monotone_in_probability() {
        let mut last = f64::NEG_INFINITY;
        for i in 0..=10 {
            let p = i as f64 / 10.0;
            let ev = expected_value(p, 2.4);
            assert!(ev >= last);
            last = ev;
        }
    }

    #[test]
    fn score_below_threshold_is_soft_rejected() {
        let f = slate_fixture(
            7,
            ProbTriple::new(0.40, 0.32, 0.28),
            Some(MarketOdds {
                home: 2.2,
                draw: 3.4,
                away: 3.4,
            }),
        );
        let eval = evaluate(&[Outcome::Home], &[f], 5.0, 0);
        assert!(!eval.accepted);
        assert_eq!(eval.contradictions, 0);
        assert!(eval.ev_score.is_finite());
        assert!(eval.reason.contains("threshold"));
    }

    fn scored(score: f64, hits: i64) -> ScoredOutcome {
        ScoredOutcome {
            ev_score: score,
            hits,
            total_picks: 13,
        }
    }

    #[test]
    fn threshold_learning_respects_acceptance_bounds() {
        // 100 tickets: scores 0..1, hit counts correlated with score.
        let data: Vec<ScoredOutcome> = (0..100)
            .map(|i| scored(i as f64 / 100.0, 4 + (i as i64) / 12))
            .collect();
        let learned = learn_threshold(&data).expect("enough samples");
        let accepted = data
            .iter()
            .filter(|s| s.ev_score >= learned.ev_threshold)
            .count() as f64
            / data.len() as f64;
        assert!(accepted >= ACCEPTANCE_BOUNDS.0 - 1e-9);
        assert!(accepted <= ACCEPTANCE_BOUNDS.1 + 1e-9);
        // With hit rate rising in score, the best in-bounds threshold is
        // the most selective one.
        assert_relative_eq!(accepted, ACCEPTANCE_BOUNDS.0, epsilon = 0.02);
    }

    #[test]
    fn threshold_learning_needs_samples() {
        let data: Vec<ScoredOutcome> = (0..10).map(|i| scored(i as f64, 5)).collect();
        assert!(learn_threshold(&data).is_none());
    }
}
