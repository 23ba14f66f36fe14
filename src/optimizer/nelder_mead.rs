//! Nelder-Mead derivative-free simplex search over the full flattened
//! parameter vector (covariance, auxiliary, and coefficients together) -
//! per §4.5, selecting Nelder-Mead for the covariance block means it also
//! drives the coefficient block in the same run.

use crate::error::Result;
use crate::options::FitOptions;

use super::{FitOutcome, Objective, Params};

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;
/// Substituted for a NaN/Inf evaluation so the simplex treats it as a
/// (very) bad point instead of propagating NaN through comparisons.
const PENALTY: f64 = 1e12;

fn eval_flat(objective: &mut dyn Objective, template: &Params, flat: &[f64]) -> f64 {
    let params = template.from_flat(flat);
    match objective.evaluate(&params) {
        Ok(e) if e.neg_ll.is_finite() => e.neg_ll,
        _ => PENALTY,
    }
}

fn rel_change(a: f64, b: f64) -> f64 {
    (a - b).abs() / b.abs().max(1.0)
}

pub fn run(objective: &mut dyn Objective, init: Params, opts: &FitOptions) -> Result<FitOutcome> {
    let n = init.total_len();
    let x0 = init.to_flat();
    if n == 0 {
        let eval = objective.evaluate(&init)?;
        return Ok(FitOutcome { params: init, neg_ll: eval.neg_ll, iterations: 0, stalled: false });
    }

    let mut simplex: Vec<Vec<f64>> = vec![x0.clone()];
    for i in 0..n {
        let mut v = x0.clone();
        v[i] += if v[i].abs() > 1e-8 { 0.05 * v[i] } else { 0.05 };
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| eval_flat(objective, &init, v)).collect();

    let mut iterations = 0usize;
    let mut stalled = true;
    for iter in 0..opts.max_iter {
        iterations = iter + 1;
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        if rel_change(values[0], values[n]) < opts.delta_rel_conv {
            stalled = false;
            break;
        }

        let centroid: Vec<f64> = (0..n).map(|j| simplex[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64).collect();
        let reflect: Vec<f64> = (0..n).map(|j| centroid[j] + REFLECT * (centroid[j] - simplex[n][j])).collect();
        let f_reflect = eval_flat(objective, &init, &reflect);

        if f_reflect < values[0] {
            let expand: Vec<f64> = (0..n).map(|j| centroid[j] + EXPAND * (reflect[j] - centroid[j])).collect();
            let f_expand = eval_flat(objective, &init, &expand);
            if f_expand < f_reflect {
                simplex[n] = expand;
                values[n] = f_expand;
            } else {
                simplex[n] = reflect;
                values[n] = f_reflect;
            }
        } else if f_reflect < values[n - 1] {
            simplex[n] = reflect;
            values[n] = f_reflect;
        } else {
            let contract: Vec<f64> = (0..n).map(|j| centroid[j] + CONTRACT * (simplex[n][j] - centroid[j])).collect();
            let f_contract = eval_flat(objective, &init, &contract);
            if f_contract < values[n] {
                simplex[n] = contract;
                values[n] = f_contract;
            } else {
                for i in 1..=n {
                    for j in 0..n {
                        simplex[i][j] = simplex[0][j] + SHRINK * (simplex[i][j] - simplex[0][j]);
                    }
                    values[i] = eval_flat(objective, &init, &simplex[i]);
                }
            }
        }
    }

    let mut best_idx = 0;
    for i in 1..values.len() {
        if values[i] < values[best_idx] {
            best_idx = i;
        }
    }
    let params = init.from_flat(&simplex[best_idx]);
    Ok(FitOutcome { params, neg_ll: values[best_idx], iterations, stalled })
}
