//! Exponential-kernel GP on a small 1-D grid, dense Cholesky path: fit
//! then predict at both a training location (mean should recover the
//! fitted pseudo-response closely) and a genuinely new location.

use gprem::{Engine, FitOptions, GpSpec, Kernel, ModelSpec, PathPreference, PredictOptions};
use gprem::engine::PredictionRow;
use gprem::predictor::ComponentQuery;
use ndarray::Array1;

fn simulate(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut coords = Vec::new();
    let mut y = Vec::new();
    for i in 0..n {
        let x = i as f64 * 0.2;
        coords.push(vec![x]);
        y.push((x * 0.7).sin());
    }
    (coords, y)
}

/// Distance from a query coordinate to every unique training location, in
/// the same (first-occurrence) order `Engine::create` assigned them - here
/// just the original insertion order, since every simulated coordinate is
/// already distinct.
fn distances_to_training(coords: &[Vec<f64>], query: f64) -> Array1<f64> {
    Array1::from_iter(coords.iter().map(|c| (c[0] - query).abs()))
}

#[test]
fn fit_and_predict_are_finite_with_nonnegative_variance() {
    let (coords, y) = simulate(30);
    let n = y.len();

    let spec = ModelSpec {
        cluster_ids: vec![0; n],
        grouped: vec![],
        gp: vec![GpSpec {
            coords: coords.clone(),
            kernel: Kernel::Exponential,
            coefficient: None,
            initial_variance: 1.0,
            initial_range: 0.5,
        }],
        likelihood: "gaussian".into(),
        path_preference: PathPreference::Dense,
    };

    let mut engine = Engine::create(&spec, FitOptions { max_iter: 50, ..FitOptions::default() }, PredictOptions::default()).unwrap();
    engine.set_response(&y).unwrap();
    let summary = engine.fit().unwrap();
    assert!(summary.neg_log_likelihood.is_finite());
    assert_eq!(summary.cov_pars.len(), 2);
    assert!(summary.cov_pars[0] > 0.0 && summary.cov_pars[1] > 0.0);

    engine.set_prediction_data(vec![
        PredictionRow {
            cluster_id: 0,
            queries: vec![ComponentQuery::GpDistance(distances_to_training(&coords, 0.0))],
            fixed_offset: 0.0,
            covariates: None,
        },
        PredictionRow {
            cluster_id: 0,
            queries: vec![ComponentQuery::GpDistance(distances_to_training(&coords, 100.0))],
            fixed_offset: 0.0,
            covariates: None,
        },
    ]);
    let preds = engine.predict().unwrap();
    assert_eq!(preds.len(), 2);
    for p in &preds {
        assert!(p.mean.is_finite());
        let v = p.variance.expect("predict_var defaults to true");
        assert!(v >= -1e-9);
    }
    // A point far from every training location should revert close to the
    // prior mean and see close to the prior marginal variance.
    assert!(preds[1].mean.abs() < preds[0].mean.abs() + summary.cov_pars[0]);
}
