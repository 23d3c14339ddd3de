//! Interventional Shapley values against a baseline row.
//!
//! Coalition `S` is evaluated as the baseline with the inputs in `S`
//! switched to their actual values. Inputs already equal to the baseline
//! are dummy players with zero attribution and are left out of the game.
//! Both estimators satisfy `Σ φ = f(x) - f(baseline)`: exact enumeration
//! by construction, permutation sampling because every permutation
//! telescopes to the same difference.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, PartialEq)]
pub struct ShapleyValues {
    /// Per input, aligned with the evaluated row
    pub phi: Vec<f64>,
    /// f(baseline)
    pub base_value: f64,
    /// f(x)
    pub value: f64,
}

fn players(x: &[f64], base: &[f64]) -> Vec<usize> {
    x.iter()
        .zip(base)
        .enumerate()
        .filter(|(_, (xi, bi))| xi.to_bits() != bi.to_bits())
        .map(|(i, _)| i)
        .collect()
}

/// Number of inputs that differ from the baseline.
pub fn player_count(x: &[f64], base: &[f64]) -> usize {
    players(x, base).len()
}

/// Largest player count `exact` is asked to enumerate; 2^16 coalition rows.
pub const MAX_EXACT_PLAYERS: usize = 16;

/// Exact enumeration over all 2^m coalitions of the m non-baseline inputs.
/// Callers keep m at or below `MAX_EXACT_PLAYERS`.
pub fn exact<E>(
    x: &[f64],
    base: &[f64],
    eval: impl Fn(&[Vec<f64>]) -> Result<Vec<f64>, E>,
) -> Result<ShapleyValues, E> {
    let players = players(x, base);
    let m = players.len();
    let n_coalitions = 1usize << m;

    let rows: Vec<Vec<f64>> = (0..n_coalitions)
        .map(|mask| {
            let mut row = base.to_vec();
            for (bit, &p) in players.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    row[p] = x[p];
                }
            }
            row
        })
        .collect();
    let v = eval(&rows)?;

    // w(s) = s! (m - s - 1)! / m!
    let factorial: Vec<f64> = (0..=m)
        .scan(1.0, |acc, k| {
            if k > 0 {
                *acc *= k as f64;
            }
            Some(*acc)
        })
        .collect();
    let weight = |s: usize| factorial[s] * factorial[m - s - 1] / factorial[m];

    let mut phi = vec![0.0; x.len()];
    for (bit, &p) in players.iter().enumerate() {
        let flag = 1 << bit;
        let mut total = 0.0;
        for mask in 0..n_coalitions {
            if mask & flag == 0 {
                let s = (mask as u64).count_ones() as usize;
                total += weight(s) * (v[mask | flag] - v[mask]);
            }
        }
        phi[p] = total;
    }

    Ok(ShapleyValues {
        phi,
        base_value: v[0],
        value: v[n_coalitions - 1],
    })
}

/// Monte Carlo estimate over `samples` random permutations. Deterministic
/// for a given seed.
pub fn sampled<E>(
    x: &[f64],
    base: &[f64],
    eval: impl Fn(&[Vec<f64>]) -> Result<Vec<f64>, E>,
    samples: usize,
    seed: u64,
) -> Result<ShapleyValues, E> {
    let players = players(x, base);
    let m = players.len();
    let samples = samples.max(1);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut orders = Vec::with_capacity(samples);
    let mut rows = Vec::with_capacity(samples * (m + 1));
    for _ in 0..samples {
        let mut order = players.clone();
        order.shuffle(&mut rng);
        let mut row = base.to_vec();
        rows.push(row.clone());
        for &p in &order {
            row[p] = x[p];
            rows.push(row.clone());
        }
        orders.push(order);
    }
    let v = eval(&rows)?;

    let mut phi = vec![0.0; x.len()];
    for (s, order) in orders.iter().enumerate() {
        let offset = s * (m + 1);
        for (k, &p) in order.iter().enumerate() {
            phi[p] += v[offset + k + 1] - v[offset + k];
        }
    }
    for value in phi.iter_mut() {
        *value /= samples as f64;
    }

    Ok(ShapleyValues {
        phi,
        base_value: v[0],
        value: v[m],
    })
}
