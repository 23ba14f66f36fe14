//! `predict` is a pure read of already-fitted per-cluster state, so
//! repeated calls must be idempotent. And since cross-cluster covariance
//! is zero by construction, two clusters fed bit-identical data (same
//! group structure, same response) must produce bit-identical per-cluster
//! Laplace solves and predictions - any leakage between clusters would
//! break that symmetry.

use gprem::{Engine, FitOptions, GroupedSpec, ModelSpec, PathPreference, PredictOptions};
use gprem::engine::PredictionRow;
use gprem::predictor::ComponentQuery;

fn simulate_one_cluster(n_groups: usize, per_group: usize) -> (Vec<i64>, Vec<f64>) {
    let mut group_ids = Vec::new();
    let mut y = Vec::new();
    for g in 0..n_groups {
        let group_effect = if g % 2 == 0 { 0.8 } else { -0.6 };
        for i in 0..per_group {
            group_ids.push(g as i64);
            let noise = ((i * 3 + g * 7) % 9) as f64 / 9.0 - 0.5;
            y.push(group_effect + noise);
        }
    }
    (group_ids, y)
}

#[test]
fn repeated_predict_calls_are_idempotent() {
    let (group_ids, y) = simulate_one_cluster(6, 5);
    let n = y.len();
    let spec = ModelSpec {
        cluster_ids: vec![0; n],
        grouped: vec![GroupedSpec { group_ids, coefficient: None, initial_variance: 1.0 }],
        gp: vec![],
        likelihood: "gaussian".into(),
        path_preference: PathPreference::Dense,
    };
    let mut engine = Engine::create(&spec, FitOptions::default(), PredictOptions::default()).unwrap();
    engine.set_response(&y).unwrap();
    engine.fit().unwrap();
    engine.set_prediction_data(vec![PredictionRow {
        cluster_id: 0,
        queries: vec![ComponentQuery::GroupedLevel(Some(1))],
        fixed_offset: 0.0,
        covariates: None,
    }]);

    let first = engine.predict().unwrap();
    let second = engine.predict().unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
        assert_eq!(a.variance.map(f64::to_bits), b.variance.map(f64::to_bits));
    }
}

#[test]
fn clusters_with_identical_data_get_identical_predictions() {
    let (group_ids_one, y_one) = simulate_one_cluster(5, 4);
    let n_one = y_one.len();

    let mut cluster_ids = vec![0i64; n_one];
    cluster_ids.extend(std::iter::repeat(1i64).take(n_one));
    let mut group_ids = group_ids_one.clone();
    group_ids.extend(group_ids_one.iter().copied());
    let mut y = y_one.clone();
    y.extend(y_one.iter().copied());

    let spec = ModelSpec {
        cluster_ids,
        grouped: vec![GroupedSpec { group_ids, coefficient: None, initial_variance: 1.0 }],
        gp: vec![],
        likelihood: "gaussian".into(),
        path_preference: PathPreference::Dense,
    };
    let mut engine = Engine::create(&spec, FitOptions::default(), PredictOptions::default()).unwrap();
    engine.set_response(&y).unwrap();
    engine.fit().unwrap();

    engine.set_prediction_data(vec![
        PredictionRow { cluster_id: 0, queries: vec![ComponentQuery::GroupedLevel(Some(2))], fixed_offset: 0.0, covariates: None },
        PredictionRow { cluster_id: 1, queries: vec![ComponentQuery::GroupedLevel(Some(2))], fixed_offset: 0.0, covariates: None },
    ]);
    let preds = engine.predict().unwrap();
    assert_eq!(preds.len(), 2);
    assert!((preds[0].mean - preds[1].mean).abs() < 1e-9);
    match (preds[0].variance, preds[1].variance) {
        (Some(v0), Some(v1)) => assert!((v0 - v1).abs() < 1e-9),
        (None, None) => {}
        _ => panic!("variance presence should match across identical clusters"),
    }
}
