//! Weighted prize selection.
//!
//! The draw walks the pool in the order it was given, subtracting each weight
//! from a uniform value in `[0, total)` until the value drops to zero or
//! below. Pool order therefore decides which prize absorbs boundary residue;
//! callers must never reorder a pool before drawing from it.

use rand::Rng;
use thiserror::Error;
use wheelspin_types::{Prize, PrizeProbability};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    #[error("no candidates to draw from")]
    EmptyPool,
}

/// How a forced id was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forced {
    /// No forced id was supplied (or it was blank).
    None,
    /// The forced id matched a candidate and that candidate was returned.
    Hit,
    /// The forced id matched nothing; a weighted draw was made instead.
    Stale,
}

/// The chosen prize and its share of the pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selection<'a> {
    pub prize: &'a Prize,
    pub probability_percent: f64,
    pub forced: Forced,
}

/// Sum of all weights in the pool.
pub fn total_weight(candidates: &[Prize]) -> f64 {
    candidates.iter().map(|prize| prize.weight).sum()
}

fn percent_of(prize: &Prize, total: f64) -> f64 {
    if total > 0.0 {
        prize.weight / total * 100.0
    } else {
        0.0
    }
}

/// Probability of every candidate, in pool order. No randomness involved.
pub fn calculate_probabilities(candidates: &[Prize]) -> Vec<PrizeProbability> {
    let total = total_weight(candidates);
    candidates
        .iter()
        .map(|prize| {
            let percent = percent_of(prize, total);
            PrizeProbability {
                prize: prize.clone(),
                percent,
                fraction: percent / 100.0,
            }
        })
        .collect()
}

/// Select one prize from `candidates`.
///
/// A non-blank `forced_id` that names a candidate wins deterministically and
/// reports its ordinary weighted probability. A forced id that names nothing
/// falls back to the weighted draw and is reported as [Forced::Stale].
pub fn select<'a, R: Rng + ?Sized>(
    rng: &mut R,
    candidates: &'a [Prize],
    forced_id: Option<&str>,
) -> Result<Selection<'a>, SelectError> {
    let Some(last) = candidates.last() else {
        return Err(SelectError::EmptyPool);
    };
    let total = total_weight(candidates);

    let mut forced = Forced::None;
    if let Some(id) = forced_id.filter(|id| !id.trim().is_empty()) {
        match candidates.iter().find(|prize| prize.id == id) {
            Some(prize) => {
                return Ok(Selection {
                    prize,
                    probability_percent: percent_of(prize, total),
                    forced: Forced::Hit,
                })
            }
            None => forced = Forced::Stale,
        }
    }

    let prize = draw(rng, candidates, total).unwrap_or(last);
    Ok(Selection {
        prize,
        probability_percent: percent_of(prize, total),
        forced,
    })
}

/// Cumulative-weight inversion. Returns `None` when the walk falls off the
/// end (non-positive total, or float residue on the last step).
fn draw<'a, R: Rng + ?Sized>(
    rng: &mut R,
    candidates: &'a [Prize],
    total: f64,
) -> Option<&'a Prize> {
    if !(total > 0.0 && total.is_finite()) {
        return None;
    }
    let mut remaining = rng.gen::<f64>() * total;
    for prize in candidates {
        remaining -= prize.weight;
        if remaining <= 0.0 {
            return Some(prize);
        }
    }
    None
}
