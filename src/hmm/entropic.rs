//! Maximum a posteriori training under the entropic prior `P(θ) ∝ Π θ^θ`,
//! which pulls every transition row and emission table towards low
//! entropy and drives weakly supported parameters to zero.

use std::collections::HashSet;
use std::time::Instant;

use crate::dataset::Corpus;

use super::emission::{Emission, WordTable};
use super::model::SequenceModel;
use super::state::BACKGROUND;
use super::trainer::{expectations, Expectations, LikelihoodTracker, TrainReport, TrainingEngine};

/// EM iterations always run before convergence is checked.
pub const MIN_ENTROPIC_ITERATIONS: usize = 5;

const MAX_BISECTIONS: usize = 200;
const MAX_LAMBERT_ITERATIONS: usize = 200;

/// `W₋₁(-e^{-x})` for `x >= 1`, the lower real branch of the Lambert W
/// function, by the recurrence `w ← -x - ln|w|`.
pub fn lambert_w_lower(x: f64) -> f64 {
    let x = x.max(1.0);
    let mut w = -x;
    for _ in 0..MAX_LAMBERT_ITERATIONS {
        let next = -x - w.abs().ln();
        if ((next - w) / w).abs() < 1e-12 {
            return next;
        }
        w = next;
    }
    w
}

/// Root of `w / θ + ln θ = c` on `(0, w]`, where the left side decreases.
fn component(w: f64, c: f64) -> f64 {
    -w / lambert_w_lower(c - w.ln())
}

/// Entropic MAP estimate of one multinomial from expected counts `w`: the
/// stationary point of `Σ w ln θ + θ ln θ` on the simplex. The Lagrange
/// multiplier is found by bisection. None when there is no interior
/// solution (too little evidence in the row).
pub fn map_multinomial(w: &[f64]) -> Option<Vec<f64>> {
    let theta_at = |c: f64| -> Vec<f64> { w.iter().map(|&x| if x > 0.0 { component(x, c) } else { 0.0 }).collect() };
    let total = |c: f64| -> f64 { theta_at(c).iter().sum() };

    let mut lo = w.iter().filter(|&&x| x > 0.0).map(|x| 1.0 + x.ln()).fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !(total(lo) > 1.0) {
        return None;
    }
    let mut step = 1.0;
    let mut hi = lo + step;
    while total(hi) > 1.0 {
        step *= 2.0;
        if step > 1e15 {
            return None;
        }
        hi = lo + step;
    }
    for _ in 0..MAX_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        if total(mid) > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-13 * hi.abs().max(1.0) {
            break;
        }
    }

    let mut theta = theta_at(hi);
    let sum: f64 = theta.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return None;
    }
    theta.iter_mut().for_each(|t| *t /= sum);
    Some(theta)
}

/// `Σ θ ln θ`, the log of the entropic prior up to a constant.
fn neg_entropy<'a, I: IntoIterator<Item = &'a f64>>(theta: I) -> f64 {
    theta.into_iter().filter(|&&t| t > 0.0).map(|t| t * t.ln()).sum()
}

/// Expected complete-data log-likelihood of one multinomial plus its log
/// prior. Negative infinity when an observed outcome has zero probability.
fn block_objective(w: &[f64], theta: &[f64]) -> f64 {
    let mut value = neg_entropy(theta);
    for (&x, &t) in w.iter().zip(theta) {
        if x > 0.0 {
            if t <= 0.0 {
                return f64::NEG_INFINITY;
            }
            value += x * t.ln();
        }
    }
    value
}

/// Best of the current parameters, the maximum-likelihood estimate and the
/// entropic MAP estimate. Returns None when the current parameters win.
fn best_block(w: &[f64], current: &[f64]) -> Option<Vec<f64>> {
    let mut best = None;
    let mut best_value = block_objective(w, current);
    let total: f64 = w.iter().sum();
    let ml = if total > 0.0 { Some(w.iter().map(|x| x / total).collect::<Vec<f64>>()) } else { None };
    for candidate in map_multinomial(w).into_iter().chain(ml) {
        let value = block_objective(w, &candidate);
        if value > best_value {
            best_value = value;
            best = Some(candidate);
        }
    }
    best
}

/// The per-word table an emission holds its free parameters in.
fn own_table(e: &Emission) -> Option<WordTable> {
    match e {
        Emission::Direct(d) => Some(d.table().clone()),
        Emission::Counted(c) => Some(c.counts().keys().map(|w| (w.clone(), c.probability(w))).collect()),
        Emission::Unseen(u) => Some(u.seen().table().clone()),
        _ => None,
    }
}

/// Log-likelihood in `stats` plus the entropic log prior of every
/// transition row and emission table of `model`.
pub fn entropic_log_posterior(model: &SequenceModel, stats: &Expectations) -> f64 {
    let mut value = stats.log_likelihood;
    for state in &model.states {
        value += neg_entropy(&state.transition);
    }
    for state in &model.states[BACKGROUND..] {
        if let Some(table) = state.emission.as_ref().and_then(own_table) {
            value += neg_entropy(table.values());
        }
    }
    value
}

impl<'m> TrainingEngine<'m> {
    /// MAP M-step. Returns the largest change of any parameter.
    pub fn maximize_entropic(&mut self, stats: &Expectations) -> f64 {
        let L = self.model().states.len();
        let mut max_change: f64 = 0.0;

        for i in 0..L {
            if !(stats.visits[i] > 0.0) {
                continue;
            }
            self.mark_visited(i);
            let w: Vec<f64> = (0..L).map(|j| stats.transition(i, j)).collect();
            let state = &mut self.model_mut().states[i];
            if let Some(row) = best_block(&w, &state.transition) {
                for (new, old) in row.iter().zip(&state.transition) {
                    max_change = max_change.max((new - old).abs());
                }
                state.transition = row;
            }
        }

        for i in BACKGROUND..L {
            if !self.model().states[i].emits_variably() {
                continue;
            }
            if !(stats.visits[i] > 0.0) {
                self.retire_if_unvisited(i);
                continue;
            }
            let emission = match self.model_mut().states[i].emission.as_mut() {
                Some(e) => e,
                None => continue,
            };
            let current = match own_table(emission) {
                Some(t) => t,
                None => {
                    max_change = max_change.max(emission.adapt(&stats.words[i]));
                    continue;
                }
            };
            let mut words: Vec<&String> = current.keys().collect();
            for word in stats.words[i].keys() {
                if !current.contains_key(word) {
                    words.push(word);
                }
            }
            let w: Vec<f64> = words.iter().map(|&x| stats.words[i].get(x).copied().unwrap_or(0.0)).collect();
            let theta: Vec<f64> = words.iter().map(|&x| current.get(x).copied().unwrap_or(0.0)).collect();
            if let Some(fresh) = best_block(&w, &theta) {
                let table: WordTable = words.iter().zip(&fresh).map(|(&x, &p)| (x.clone(), p)).collect();
                max_change = max_change.max(emission.adapt(&table));
            }
        }

        self.update_parents(stats);
        max_change
    }

    /// EM towards the entropic MAP estimate on label-restricted, scaled
    /// passes. `log_likelihoods` of the report holds the log-posterior
    /// before each M-step and after the last one.
    pub fn entropic_map(&mut self, corpus: &Corpus) -> TrainReport {
        let mut report = TrainReport::default();
        let mut tracker = LikelihoodTracker::new();
        let no_skip = HashSet::new();
        let min_iterations = self.options().min_iterations.max(MIN_ENTROPIC_ITERATIONS);
        let begin = Instant::now();
        self.track_states();

        loop {
            self.model().check_normalized();
            let stats = expectations(self.model(), corpus, true, true, &no_skip, self.options().pseudo_unknowns);
            report.ungeneratable = stats.ungeneratable.len();
            if stats.generated == 0 {
                log::error!("none of the {} sequences can be generated; training stops", corpus.len());
                break;
            }
            let lp = entropic_log_posterior(self.model(), &stats);
            log::info!("iteration {}: log posterior {lp:.6} ({} sequences excluded)", report.iterations, report.ungeneratable);
            report.log_likelihoods.push(lp);
            let converged = tracker.update(lp, "entropic MAP");
            if converged && report.iterations >= min_iterations {
                report.converged = true;
                break;
            }
            if report.iterations >= self.options().max_iterations {
                log::warn!("entropic MAP stopped after {} iterations without converging", report.iterations);
                break;
            }
            let change = self.maximize_entropic(&stats);
            report.iterations += 1;
            log::debug!("iteration {}: largest parameter change {change:.6}", report.iterations);
        }

        report.monotonicity_violations = tracker.violations;
        report.dead_states = self.dead_states().to_vec();
        log::info!("entropic MAP finished after {} iterations, took {:?}", report.iterations, begin.elapsed());
        report
    }
}
