//! Dixon–Coles team-strength estimator.
//!
//! Maximum-likelihood fit of per-team attack/defence ratings plus global
//! home advantage and the low-score correlation `rho`, with exponential
//! time decay `exp(-xi * days)` on each match's contribution. The optimiser
//! is plain gradient ascent with a decaying step, re-centring attack
//! ratings per league after every iteration for identifiability.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::model::{DixonColesParams, LeagueParams, TeamStrength};

/// A settled historical match, as supplied by the feature store.
#[derive(Debug, Clone, Copy)]
pub struct MatchRecord {
    pub match_id: i64,
    pub date: NaiveDate,
    pub league_id: i64,
    pub home_id: i64,
    pub away_id: i64,
    pub home_goals: u32,
    pub away_goals: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EstimatorConfig {
    /// Matches older than this are dropped before fitting.
    pub lookback_years: f64,
    /// Time-decay rate per day. 0.0065 gives a half-life of roughly 107 days.
    pub xi: f64,
    /// L2 pull of team ratings toward the league mean. Kept small so
    /// five matches of evidence dominate the prior.
    pub l2: f64,
    pub learning_rate: f64,
    pub max_iters: usize,
    /// Converged when the largest parameter change falls below this.
    pub tol_param: f64,
    /// ... or when the gradient norm falls below this.
    pub tol_grad: f64,
    /// Teams with fewer matches than this stay pinned to the league mean.
    pub min_team_matches: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            lookback_years: 5.0,
            xi: 0.0065,
            l2: 0.01,
            learning_rate: 0.10,
            max_iters: 200,
            tol_param: 1e-5,
            tol_grad: 1e-4,
            min_team_matches: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub strengths: HashMap<i64, TeamStrength>,
    pub params: DixonColesParams,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub matches_used: usize,
}

/// The Dixon–Coles low-score correction. Modifies only 0-0, 1-0, 0-1 and
/// 1-1; unity elsewhere. Clamped away from zero so log-likelihoods stay
/// finite for extreme parameter proposals mid-optimisation.
pub fn tau(home_goals: u32, away_goals: u32, lambda_h: f64, lambda_a: f64, rho: f64) -> f64 {
    let t = match (home_goals, away_goals) {
        (0, 0) => 1.0 - lambda_h * lambda_a * rho,
        (0, 1) => 1.0 + lambda_h * rho,
        (1, 0) => 1.0 + lambda_a * rho,
        (1, 1) => 1.0 - rho,
        _ => 1.0,
    };
    t.max(1e-10)
}

/// Fit team strengths from history. `league` restricts the training window
/// to one league; `None` fits across all of them.
///
/// Returns `InsufficientData` when the filtered window averages fewer than
/// `min_team_matches` appearances per team, and `NonConvergence` when the
/// optimiser exhausts `max_iters`; callers should use [`fit_with_retry`]
/// which performs the one mandated tighter-tolerance retry.
pub fn fit(
    matches: &[MatchRecord],
    reference_date: NaiveDate,
    league: Option<i64>,
    cfg: &EstimatorConfig,
    model_version: &str,
) -> EngineResult<FitResult> {
    let window: Vec<MatchRecord> = matches
        .iter()
        .filter(|m| league.map_or(true, |l| m.league_id == l))
        .filter(|m| {
            let age = (reference_date - m.date).num_days();
            age >= 0 && (age as f64) <= cfg.lookback_years * 365.25
        })
        .copied()
        .collect();

    let mut appearances: HashMap<i64, usize> = HashMap::new();
    for m in &window {
        *appearances.entry(m.home_id).or_insert(0) += 1;
        *appearances.entry(m.away_id).or_insert(0) += 1;
    }
    let teams: Vec<i64> = {
        let mut t: Vec<i64> = appearances.keys().copied().collect();
        t.sort_unstable();
        t
    };
    if teams.is_empty()
        || window.len() * 2 < cfg.min_team_matches * teams.len()
    {
        return Err(EngineError::InsufficientData(format!(
            "{} matches over {} teams is below {} per team",
            window.len(),
            teams.len(),
            cfg.min_team_matches
        )));
    }

    let index: HashMap<i64, usize> = teams.iter().enumerate().map(|(i, t)| (*t, i)).collect();
    let league_of: HashMap<i64, i64> = team_league_map(&window);
    let n = teams.len();

    // Established teams fit freely; sparse (promoted) teams feel a stronger
    // pull toward the league mean so the prior dominates until ~5 matches.
    let established: Vec<bool> = teams
        .iter()
        .map(|t| appearances[t] >= cfg.min_team_matches)
        .collect();

    let mut attack = vec![0.0_f64; n];
    let mut defense = vec![0.0_f64; n];
    let mut home_adv: f64 = 0.25;
    let mut rho: f64 = -0.10;

    let weights: Vec<f64> = window
        .iter()
        .map(|m| (-cfg.xi * (reference_date - m.date).num_days() as f64).exp())
        .collect();
    let weight_sum: f64 = weights.iter().sum::<f64>().max(1e-9);

    let mut iterations = 0;
    let mut converged = false;
    let mut last_grad_norm = f64::INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;

    for iter in 0..cfg.max_iters {
        iterations = iter + 1;
        let lr = cfg.learning_rate / (1.0 + 0.02 * iter as f64);

        let mut g_attack = vec![0.0_f64; n];
        let mut g_defense = vec![0.0_f64; n];
        let mut g_home = 0.0_f64;
        let mut g_rho = 0.0_f64;
        let mut ll = 0.0_f64;

        for (m, &w) in window.iter().zip(&weights) {
            let hi = index[&m.home_id];
            let ai = index[&m.away_id];
            let lambda_h = (home_adv + attack[hi] - defense[ai]).exp();
            let lambda_a = (attack[ai] - defense[hi]).exp();
            let x = m.home_goals as f64;
            let y = m.away_goals as f64;
            let t = tau(m.home_goals, m.away_goals, lambda_h, lambda_a, rho);

            ll += w * (t.ln() + x * lambda_h.ln() - lambda_h + y * lambda_a.ln() - lambda_a);

            // d log tau / d lambda, nonzero only on the four low scores.
            let (dlt_dlh, dlt_dla, dt_drho) = match (m.home_goals, m.away_goals) {
                (0, 0) => (-lambda_a * rho / t, -lambda_h * rho / t, -lambda_h * lambda_a / t),
                (0, 1) => (rho / t, 0.0, lambda_h / t),
                (1, 0) => (0.0, rho / t, lambda_a / t),
                (1, 1) => (0.0, 0.0, -1.0 / t),
                _ => (0.0, 0.0, 0.0),
            };

            // Gradient wrt log-lambda, chain-ruled through tau.
            let gh = (x - lambda_h) + lambda_h * dlt_dlh;
            let ga = (y - lambda_a) + lambda_a * dlt_dla;

            g_home += w * gh;
            g_attack[hi] += w * gh;
            g_defense[ai] -= w * gh;
            g_attack[ai] += w * ga;
            g_defense[hi] -= w * ga;
            g_rho += w * dt_drho;
        }

        log_likelihood = ll;

        // Per-league mean pull (ridge prior); sparse teams get a heavy pull
        // so they track the mean until the data takes over.
        let (mean_attack, mean_defense) = league_means(&teams, &league_of, &attack, &defense);
        for i in 0..n {
            let lg = league_of[&teams[i]];
            let (ma, md) = mean_attack
                .get(&lg)
                .copied()
                .zip(mean_defense.get(&lg).copied())
                .unwrap_or((0.0, 0.0));
            let pull = if established[i] { cfg.l2 } else { cfg.l2 * 50.0 };
            g_attack[i] -= pull * weight_sum * (attack[i] - ma);
            g_defense[i] -= pull * weight_sum * (defense[i] - md);
        }

        let mut max_delta = 0.0_f64;
        let scale = lr / weight_sum;
        for i in 0..n {
            let da = scale * g_attack[i];
            let dd = scale * g_defense[i];
            attack[i] += da;
            defense[i] += dd;
            max_delta = max_delta.max(da.abs()).max(dd.abs());
        }
        let dh = scale * g_home;
        home_adv += dh;
        let dr = scale * g_rho;
        rho = (rho + dr).clamp(-0.35, 0.35);
        max_delta = max_delta.max(dh.abs()).max(dr.abs());

        // Identifiability: attack ratings sum to zero within each league.
        recenter_attack(&teams, &league_of, &mut attack);

        let grad_norm = {
            let mut s = g_home * g_home + g_rho * g_rho;
            for i in 0..n {
                s += g_attack[i] * g_attack[i] + g_defense[i] * g_defense[i];
            }
            (s).sqrt() / weight_sum
        };
        last_grad_norm = grad_norm;

        if max_delta < cfg.tol_param || grad_norm < cfg.tol_grad {
            converged = true;
            debug!(
                iterations,
                grad_norm, max_delta, "dixon-coles fit converged"
            );
            break;
        }
    }

    if !converged {
        return Err(EngineError::NonConvergence {
            iterations,
            grad_norm: last_grad_norm,
        });
    }

    let strengths: HashMap<i64, TeamStrength> = teams
        .iter()
        .enumerate()
        .map(|(i, t)| {
            (
                *t,
                TeamStrength {
                    attack: attack[i],
                    defense: defense[i],
                },
            )
        })
        .collect();

    let league_params = fit_league_params(&window, &weights, &strengths, home_adv);

    info!(
        model_version,
        teams = teams.len(),
        matches = window.len(),
        iterations,
        home_advantage = home_adv,
        rho,
        "team-strength fit complete"
    );

    Ok(FitResult {
        strengths,
        params: DixonColesParams {
            model_version: model_version.to_string(),
            home_advantage: home_adv,
            rho,
            xi: cfg.xi,
            league_params,
        },
        iterations,
        log_likelihood,
        matches_used: window.len(),
    })
}

/// [`fit`] plus the single mandated retry: on `NonConvergence` the fit is
/// re-run with smaller steps and a doubled iteration budget before the
/// error surfaces.
pub fn fit_with_retry(
    matches: &[MatchRecord],
    reference_date: NaiveDate,
    league: Option<i64>,
    cfg: &EstimatorConfig,
    model_version: &str,
) -> EngineResult<FitResult> {
    match fit(matches, reference_date, league, cfg, model_version) {
        Err(EngineError::NonConvergence { iterations, .. }) => {
            let tighter = EstimatorConfig {
                learning_rate: cfg.learning_rate * 0.5,
                max_iters: cfg.max_iters * 2,
                ..*cfg
            };
            debug!(iterations, "retrying dixon-coles fit with tighter steps");
            fit(matches, reference_date, league, &tighter, model_version)
        }
        other => other,
    }
}

/// A team's league is wherever it appeared most recently in the window.
fn team_league_map(window: &[MatchRecord]) -> HashMap<i64, i64> {
    let mut latest: HashMap<i64, (NaiveDate, i64)> = HashMap::new();
    for m in window {
        for team in [m.home_id, m.away_id] {
            let entry = latest.entry(team).or_insert((m.date, m.league_id));
            if m.date >= entry.0 {
                *entry = (m.date, m.league_id);
            }
        }
    }
    latest.into_iter().map(|(t, (_, l))| (t, l)).collect()
}

fn league_means(
    teams: &[i64],
    league_of: &HashMap<i64, i64>,
    attack: &[f64],
    defense: &[f64],
) -> (HashMap<i64, f64>, HashMap<i64, f64>) {
    let mut sums: HashMap<i64, (f64, f64, usize)> = HashMap::new();
    for (i, t) in teams.iter().enumerate() {
        let e = sums.entry(league_of[t]).or_insert((0.0, 0.0, 0));
        e.0 += attack[i];
        e.1 += defense[i];
        e.2 += 1;
    }
    let mut ma = HashMap::new();
    let mut md = HashMap::new();
    for (lg, (a, d, c)) in sums {
        ma.insert(lg, a / c as f64);
        md.insert(lg, d / c as f64);
    }
    (ma, md)
}

fn recenter_attack(teams: &[i64], league_of: &HashMap<i64, i64>, attack: &mut [f64]) {
    let mut sums: HashMap<i64, (f64, usize)> = HashMap::new();
    for (i, t) in teams.iter().enumerate() {
        let e = sums.entry(league_of[t]).or_insert((0.0, 0));
        e.0 += attack[i];
        e.1 += 1;
    }
    for (i, t) in teams.iter().enumerate() {
        let (sum, count) = sums[&league_of[t]];
        attack[i] -= sum / count as f64;
    }
}

/// Per-league overrides: empirical draw rate, shrunk home advantage and a
/// grid-searched league rho maximising the weighted low-score likelihood
/// under the fitted strengths.
fn fit_league_params(
    window: &[MatchRecord],
    weights: &[f64],
    strengths: &HashMap<i64, TeamStrength>,
    home_adv: f64,
) -> HashMap<i64, LeagueParams> {
    let mut by_league: HashMap<i64, Vec<usize>> = HashMap::new();
    for (i, m) in window.iter().enumerate() {
        by_league.entry(m.league_id).or_default().push(i);
    }

    let mut out = HashMap::new();
    for (league_id, idxs) in by_league {
        let n = idxs.len();
        if n == 0 {
            continue;
        }

        let mut draws = 0usize;
        let mut goal_diff_sum = 0.0_f64;
        for &i in &idxs {
            let m = &window[i];
            if m.home_goals == m.away_goals {
                draws += 1;
            }
            goal_diff_sum += m.home_goals as f64 - m.away_goals as f64;
        }
        let draw_rate = draws as f64 / n as f64;

        // Shrink the league home advantage toward the global fit on small
        // samples to avoid wild swings.
        const MIN_N: f64 = 200.0;
        let w = (n as f64 / MIN_N).clamp(0.0, 1.0);
        let raw_adv = goal_diff_sum / n as f64 * 0.5;
        let league_home_adv = (1.0 - w) * home_adv + w * raw_adv.clamp(-0.6, 0.6);

        let mut best_rho = -0.10;
        let mut best_ll = f64::NEG_INFINITY;
        for step in -25..=5 {
            let rho = step as f64 / 100.0;
            let mut ll = 0.0;
            for &i in &idxs {
                let m = &window[i];
                let (Some(h), Some(a)) = (strengths.get(&m.home_id), strengths.get(&m.away_id))
                else {
                    continue;
                };
                let lambda_h = (home_adv + h.attack - a.defense).exp();
                let lambda_a = (a.attack - h.defense).exp();
                ll += weights[i]
                    * tau(m.home_goals, m.away_goals, lambda_h, lambda_a, rho).ln();
            }
            if ll > best_ll {
                best_ll = ll;
                best_rho = rho;
            }
        }

        out.insert(
            league_id,
            LeagueParams {
                rho: best_rho,
                home_advantage: league_home_adv,
                draw_rate,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(
        id: i64,
        days_ago: i64,
        league: i64,
        home: i64,
        away: i64,
        hg: u32,
        ag: u32,
    ) -> MatchRecord {
        MatchRecord {
            match_id: id,
            date: reference() - chrono::Duration::days(days_ago),
            league_id: league,
            home_id: home,
            away_id: away,
            home_goals: hg,
            away_goals: ag,
        }
    }

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    /// A small synthetic league with a dominant team 1 and a weak team 4.
    fn synthetic_league() -> Vec<MatchRecord> {
        let mut out = Vec::new();
        let mut id = 0;
        // Three double round-robins so every team has plenty of matches.
        for round in 0..3 {
            let base = round * 90;
            let fixtures: [(i64, i64, u32, u32); 12] = [
                (1, 2, 3, 0),
                (1, 3, 2, 1),
                (1, 4, 4, 0),
                (2, 1, 0, 2),
                (2, 3, 1, 1),
                (2, 4, 2, 0),
                (3, 1, 0, 1),
                (3, 2, 1, 1),
                (3, 4, 2, 1),
                (4, 1, 0, 3),
                (4, 2, 0, 1),
                (4, 3, 0, 2),
            ];
            for (k, (h, a, hg, ag)) in fixtures.iter().enumerate() {
                out.push(record(id, base + k as i64 * 3, 10, *h, *a, *hg, *ag));
                id += 1;
            }
        }
        out
    }

    #[test]
    fn tau_modifies_only_low_scores() {
        assert_relative_eq!(tau(2, 1, 1.5, 1.2, -0.13), 1.0);
        assert_relative_eq!(tau(0, 3, 1.5, 1.2, -0.13), 1.0);
        assert!(tau(0, 0, 1.5, 1.2, -0.13) > 1.0);
        assert!(tau(1, 1, 1.5, 1.2, -0.13) > 1.0);
        assert!(tau(1, 0, 1.5, 1.2, -0.13) < 1.0);
    }

    #[test]
    fn tau_stays_positive_for_extreme_params() {
        assert!(tau(0, 0, 8.0, 8.0, 0.35) > 0.0);
    }

    #[test]
    fn fit_recovers_ordering_of_team_quality() {
        let matches = synthetic_league();
        let cfg = EstimatorConfig::default();
        let fit = fit_with_retry(&matches, reference(), None, &cfg, "test_v1").unwrap();

        let s1 = fit.strengths[&1];
        let s4 = fit.strengths[&4];
        assert!(
            s1.attack > s4.attack,
            "dominant team should out-attack the weak one: {s1:?} vs {s4:?}"
        );
        assert!(s1.defense > s4.defense);
    }

    #[test]
    fn attack_ratings_are_centred() {
        let matches = synthetic_league();
        let cfg = EstimatorConfig::default();
        let fit = fit_with_retry(&matches, reference(), None, &cfg, "test_v1").unwrap();
        let sum: f64 = fit.strengths.values().map(|s| s.attack).sum();
        assert_relative_eq!(sum, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn insufficient_data_is_reported() {
        let matches = vec![record(0, 1, 10, 1, 2, 1, 0)];
        let cfg = EstimatorConfig::default();
        let err = fit(&matches, reference(), None, &cfg, "test_v1").unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData(_)));
    }

    #[test]
    fn lookback_window_filters_old_matches() {
        let mut matches = synthetic_league();
        // Push everything outside the window except one match.
        for m in matches.iter_mut().skip(1) {
            m.date = reference() - chrono::Duration::days(10 * 365);
        }
        let cfg = EstimatorConfig::default();
        assert!(matches!(
            fit(&matches, reference(), None, &cfg, "test_v1"),
            Err(EngineError::InsufficientData(_))
        ));
    }

    #[test]
    fn league_filter_restricts_training() {
        let mut matches = synthetic_league();
        // Second league with distinct teams.
        let other: Vec<MatchRecord> = synthetic_league()
            .into_iter()
            .map(|mut m| {
                m.league_id = 20;
                m.home_id += 100;
                m.away_id += 100;
                m
            })
            .collect();
        matches.extend(other);

        let cfg = EstimatorConfig::default();
        let fit = fit_with_retry(&matches, reference(), Some(10), &cfg, "test_v1").unwrap();
        assert!(fit.strengths.contains_key(&1));
        assert!(!fit.strengths.contains_key(&101));
    }

    #[test]
    fn league_params_capture_draw_rate() {
        let matches = synthetic_league();
        let cfg = EstimatorConfig::default();
        let fit = fit_with_retry(&matches, reference(), None, &cfg, "test_v1").unwrap();
        let lp = fit.params.league_params.get(&10).unwrap();
        // 6 draws out of 36 fixtures.
        assert_relative_eq!(lp.draw_rate, 6.0 / 36.0, epsilon = 1e-9);
        assert!((-0.25..=0.05).contains(&lp.rho));
    }
}
