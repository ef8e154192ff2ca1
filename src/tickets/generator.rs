//! Archetype-constrained candidate generation.
//!
//! Proposes pick vectors consistent with the chosen archetype by sampling
//! from the target probability set, repairing compositions toward the
//! archetype's constraints, and validating before anything is emitted. A
//! candidate that fails its archetype is dropped, never surfaced.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::model::Outcome;
use crate::tickets::archetype::{
    self, away_edge_band, draw_selective_target, Archetype,
};
use crate::tickets::{SlateFixture, TicketCandidate};

/// Attempt budget per requested candidate before the generator gives up
/// on finding more distinct conforming tickets.
const ATTEMPTS_PER_CANDIDATE: usize = 40;

/// Generate up to `n` distinct candidates for the archetype. The RNG is
/// seeded by the caller (jackpot id) so a slate reproduces its candidates.
pub fn generate(
    slate: &[SlateFixture],
    archetype: Archetype,
    n: usize,
    seed: u64,
) -> Vec<TicketCandidate> {
    if slate.is_empty() || n == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out: Vec<TicketCandidate> = Vec::with_capacity(n);

    // Deterministic spine first: the composition-repaired favourite line.
    let spine = repair(spine_picks(slate), archetype, slate);
    if archetype::validate(archetype, &spine, slate).is_ok() {
        out.push(TicketCandidate {
            picks: spine,
            archetype,
        });
    }

    let mut attempts = 0usize;
    let budget = n * ATTEMPTS_PER_CANDIDATE;
    while out.len() < n && attempts < budget {
        attempts += 1;
        let picks = repair(propose(slate, archetype, &mut rng), archetype, slate);
        if archetype::validate(archetype, &picks, slate).is_err() {
            continue;
        }
        if out.iter().any(|c| c.picks == picks) {
            continue;
        }
        out.push(TicketCandidate { picks, archetype });
    }

    debug!(
        archetype = archetype.as_str(),
        requested = n,
        produced = out.len(),
        attempts,
        "candidate generation finished"
    );
    out
}

/// Argmax picks across the slate.
fn spine_picks(slate: &[SlateFixture]) -> Vec<Outcome> {
    slate.iter().map(|f| f.probs.favourite()).collect()
}

/// Sample one pick vector, tilted by archetype.
fn propose(slate: &[SlateFixture], archetype: Archetype, rng: &mut StdRng) -> Vec<Outcome> {
    match archetype {
        Archetype::Balanced => slate.iter().map(|f| sample(f, rng)).collect(),
        Archetype::FavoriteLock => slate
            .iter()
            .map(|f| {
                // Heavy tilt to the favourite, with occasional exploration.
                if rng.gen_bool(0.8) {
                    f.probs.favourite()
                } else {
                    sample(f, rng)
                }
            })
            .collect(),
        Archetype::DrawSelective => {
            let mut picks: Vec<Outcome> = slate
                .iter()
                .map(|f| sample_no_draw(f, rng))
                .collect();
            // Place draws on the most draw-likely eligible fixtures.
            let (target, _, _) = draw_selective_target(slate.len());
            let mut eligible: Vec<usize> = (0..slate.len())
                .filter(|i| {
                    slate[*i].dc_applied
                        && (slate[*i].xg_home - slate[*i].xg_away).abs() < 0.4
                })
                .collect();
            eligible.sort_by(|a, b| {
                slate[*b]
                    .probs
                    .draw
                    .partial_cmp(&slate[*a].probs.draw)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            // Jitter the cut so candidates differ.
            let take = target.min(eligible.len());
            for (rank, idx) in eligible.into_iter().enumerate() {
                if rank < take || (rank == take && rng.gen_bool(0.35)) {
                    picks[idx] = Outcome::Draw;
                }
            }
            picks
        }
        Archetype::AwayEdge => {
            let mut picks: Vec<Outcome> = slate
                .iter()
                .map(|f| sample_no_away(f, rng))
                .collect();
            let (lo, hi) = away_edge_band(slate.len());
            let mut edged: Vec<usize> = (0..slate.len())
                .filter(|i| slate[*i].away_edge_ev().is_some_and(|ev| ev > 0.0))
                .collect();
            edged.sort_by(|a, b| {
                slate[*b]
                    .away_edge_ev()
                    .partial_cmp(&slate[*a].away_edge_ev())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let span = hi.max(lo);
            let want = if span > lo {
                rng.gen_range(lo..=span)
            } else {
                lo
            };
            for idx in edged.into_iter().take(want) {
                picks[idx] = Outcome::Away;
            }
            picks
        }
    }
}

/// Composition repair: nudge a sampled vector toward the archetype's hard
/// counts so fewer proposals die in validation.
fn repair(mut picks: Vec<Outcome>, archetype: Archetype, slate: &[SlateFixture]) -> Vec<Outcome> {
    if archetype != Archetype::FavoriteLock {
        return picks;
    }
    // At most one draw and one away: excess picks collapse onto the
    // favourite.
    let mut draws = 0usize;
    let mut aways = 0usize;
    for (pick, f) in picks.iter_mut().zip(slate) {
        match pick {
            Outcome::Draw => {
                draws += 1;
                if draws > 1 {
                    *pick = f.probs.favourite();
                }
            }
            Outcome::Away => {
                aways += 1;
                if aways > 1 {
                    *pick = f.probs.favourite();
                }
            }
            Outcome::Home => {}
        }
    }
    picks
}

fn sample(f: &SlateFixture, rng: &mut StdRng) -> Outcome {
    let r: f64 = rng.gen();
    if r < f.probs.home {
        Outcome::Home
    } else if r < f.probs.home + f.probs.draw {
        Outcome::Draw
    } else {
        Outcome::Away
    }
}

fn sample_no_draw(f: &SlateFixture, rng: &mut StdRng) -> Outcome {
    let mass = f.probs.home + f.probs.away;
    if mass <= 0.0 {
        return Outcome::Home;
    }
    if rng.gen::<f64>() * mass < f.probs.home {
        Outcome::Home
    } else {
        Outcome::Away
    }
}

fn sample_no_away(f: &SlateFixture, rng: &mut StdRng) -> Outcome {
    let mass = f.probs.home + f.probs.draw;
    if mass <= 0.0 {
        return Outcome::Home;
    }
    if rng.gen::<f64>() * mass < f.probs.home {
        Outcome::Home
    } else {
        Outcome::Draw
    }
}
