//! Correlation-penalised portfolio selection.
//!
//! Greedy-plus-swap over evaluator-accepted tickets: seed with the best
//! score, add the ticket with the highest marginal bundle gain, then try
//! pairwise swaps until nothing improves. Bundles where every pair is
//! near-identical are rejected in favour of the best diverse sub-bundle.

use std::collections::HashMap;

use serde::Serialize;

use crate::model::Outcome;

/// A bundle must keep at least one pair under this correlation.
const DIVERSITY_CEILING: f64 = 0.8;

/// An accepted ticket as the optimiser sees it.
#[derive(Debug, Clone)]
pub struct RankedTicket {
    pub ticket_id: i64,
    pub picks: Vec<Outcome>,
    pub score: f64,
    pub archetype: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioDiagnostics {
    pub mean_pairwise_corr: f64,
    pub max_pairwise_corr: f64,
    pub bundle_score: f64,
    pub archetype_distribution: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct BundleSelection {
    pub selected: Vec<RankedTicket>,
    pub diagnostics: PortfolioDiagnostics,
}

/// Pick-overlap correlation between two tickets of equal length.
pub fn correlation(a: &[Outcome], b: &[Outcome]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let overlap = a.iter().zip(b).filter(|(x, y)| x == y).count();
    overlap as f64 / a.len() as f64
}

/// Correlation-penalised bundle score:
/// `sum(score) - lambda * sum_pairs(corr)`.
pub fn bundle_score(bundle: &[&RankedTicket], lambda: f64) -> f64 {
    let scores: f64 = bundle.iter().map(|t| t.score).sum();
    let mut corr = 0.0;
    for i in 0..bundle.len() {
        for j in (i + 1)..bundle.len() {
            corr += correlation(&bundle[i].picks, &bundle[j].picks);
        }
    }
    scores - lambda * corr
}

/// Select up to `max_n` tickets. Deterministic: candidates are ranked
/// lexicographically by `(-score, ticket_id)` before the greedy pass.
pub fn select(candidates: &[RankedTicket], max_n: usize, lambda: f64) -> BundleSelection {
    let mut ranked: Vec<&RankedTicket> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ticket_id.cmp(&b.ticket_id))
    });
    // Duplicates (identical pick vectors) never coexist in a bundle.
    let mut unique: Vec<&RankedTicket> = Vec::new();
    for t in ranked {
        if !unique.iter().any(|u| u.picks == t.picks) {
            unique.push(t);
        }
    }

    if unique.is_empty() || max_n == 0 {
        return BundleSelection {
            selected: Vec::new(),
            diagnostics: diagnostics(&[], lambda),
        };
    }

    // Greedy build.
    let mut bundle: Vec<&RankedTicket> = vec![unique[0]];
    while bundle.len() < max_n {
        let mut best: Option<(f64, &RankedTicket)> = None;
        let current = bundle_score(&bundle, lambda);
        for t in &unique {
            if bundle.iter().any(|b| b.ticket_id == t.ticket_id) {
                continue;
            }
            let mut trial = bundle.clone();
            trial.push(t);
            let gain = bundle_score(&trial, lambda) - current;
            let better = match best {
                None => gain > 0.0,
                Some((best_gain, _)) => gain > best_gain + 1e-12,
            };
            if better {
                best = Some((gain, t));
            }
        }
        match best {
            Some((_, t)) => bundle.push(t),
            None => break,
        }
    }

    // Swap pass: replace any member with any outsider while it improves.
    let mut improved = true;
    while improved {
        improved = false;
        let current = bundle_score(&bundle, lambda);
        'outer: for i in 0..bundle.len() {
            for t in &unique {
                if bundle.iter().any(|b| b.ticket_id == t.ticket_id) {
                    continue;
                }
                let mut trial = bundle.clone();
                trial[i] = t;
                if bundle_score(&trial, lambda) > current + 1e-12 {
                    bundle = trial;
                    improved = true;
                    break 'outer;
                }
            }
        }
    }

    // Diversity guarantee: with two or more tickets, at least one pair
    // must clear the ceiling; otherwise fall back to the best sub-bundle
    // that does.
    while bundle.len() >= 2 && !is_diverse(&bundle) {
        // Drop the lower-scored member of the tightest pair.
        let (i, j) = tightest_pair(&bundle);
        let drop = if bundle[i].score <= bundle[j].score {
            i
        } else {
            j
        };
        bundle.remove(drop);
    }

    let diags = diagnostics(&bundle, lambda);
    BundleSelection {
        selected: bundle.into_iter().cloned().collect(),
        diagnostics: diags,
    }
}

fn is_diverse(bundle: &[&RankedTicket]) -> bool {
    if bundle.len() < 2 {
        return true;
    }
    for i in 0..bundle.len() {
        for j in (i + 1)..bundle.len() {
            if correlation(&bundle[i].picks, &bundle[j].picks) < DIVERSITY_CEILING {
                return true;
            }
        }
    }
    false
}

fn tightest_pair(bundle: &[&RankedTicket]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut best_corr = -1.0;
    for i in 0..bundle.len() {
        for j in (i + 1)..bundle.len() {
            let c = correlation(&bundle[i].picks, &bundle[j].picks);
            if c > best_corr {
                best_corr = c;
                best = (i, j);
            }
        }
    }
    best
}

fn diagnostics(bundle: &[&RankedTicket], lambda: f64) -> PortfolioDiagnostics {
    let mut archetype_distribution: HashMap<String, usize> = HashMap::new();
    for t in bundle {
        *archetype_distribution.entry(t.archetype.clone()).or_insert(0) += 1;
    }
    let mut corrs = Vec::new();
    for i in 0..bundle.len() {
        for j in (i + 1)..bundle.len() {
            corrs.push(correlation(&bundle[i].picks, &bundle[j].picks));
        }
    }
    let mean = if corrs.is_empty() {
        0.0
    } else {
        corrs.iter().sum::<f64>() / corrs.len() as f64
    };
    let max = corrs.iter().copied().fold(0.0_f64, f64::max);
    PortfolioDiagnostics {
        mean_pairwise_corr: mean,
        max_pairwise_corr: max,
        bundle_score: bundle_score(bundle, lambda),
        archetype_distribution,
    }
}
