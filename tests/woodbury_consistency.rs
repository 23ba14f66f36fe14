//! Two grouped random intercepts (crossed, not nested) under a
//! Bernoulli-logit likelihood: the structure planner routes this
//! combination onto the grouped-Woodbury path (no GP component, more than
//! one grouped component, no Vecchia/FITC preference requested). Checks
//! that fitting and predicting through that reduced-rank path stay finite
//! and well-formed.

use gprem::{Engine, FitOptions, GroupedSpec, ModelSpec, PathPreference, PredictOptions};
use gprem::engine::PredictionRow;
use gprem::predictor::ComponentQuery;

fn simulate(n_a: usize, n_b: usize, per_cell: usize) -> (Vec<i64>, Vec<i64>, Vec<f64>) {
    let mut a_ids = Vec::new();
    let mut b_ids = Vec::new();
    let mut y = Vec::new();
    for a in 0..n_a {
        for b in 0..n_b {
            let logit = if (a + b) % 2 == 0 { 1.5 } else { -1.5 };
            for i in 0..per_cell {
                a_ids.push(a as i64);
                b_ids.push(b as i64);
                let p = 1.0 / (1.0 + (-logit).exp());
                let u = ((i * 13 + a * 5 + b * 3) % 10) as f64 / 10.0;
                y.push(if u < p { 1.0 } else { 0.0 });
            }
        }
    }
    (a_ids, b_ids, y)
}

#[test]
fn fit_and_predict_stay_finite_on_the_grouped_woodbury_path() {
    let (a_ids, b_ids, y) = simulate(4, 3, 5);
    let n = y.len();

    let spec = ModelSpec {
        cluster_ids: vec![0; n],
        grouped: vec![
            GroupedSpec { group_ids: a_ids, coefficient: None, initial_variance: 1.0 },
            GroupedSpec { group_ids: b_ids, coefficient: None, initial_variance: 1.0 },
        ],
        gp: vec![],
        likelihood: "bernoulli_logit".into(),
        path_preference: PathPreference::Dense,
    };

    let mut engine = Engine::create(&spec, FitOptions { max_iter: 60, ..FitOptions::default() }, PredictOptions::default()).unwrap();
    engine.set_response(&y).unwrap();

    let summary = engine.fit().unwrap();
    assert!(summary.neg_log_likelihood.is_finite());
    assert_eq!(summary.cov_pars.len(), 2);
    assert!(summary.cov_pars.iter().all(|&p| p.is_finite() && p > 0.0));

    engine.set_prediction_data(vec![
        PredictionRow {
            cluster_id: 0,
            queries: vec![ComponentQuery::GroupedLevel(Some(0)), ComponentQuery::GroupedLevel(Some(0))],
            fixed_offset: 0.0,
            covariates: None,
        },
        PredictionRow {
            cluster_id: 0,
            queries: vec![ComponentQuery::GroupedLevel(None), ComponentQuery::GroupedLevel(None)],
            fixed_offset: 0.0,
            covariates: None,
        },
    ]);
    let preds = engine.predict().unwrap();
    assert_eq!(preds.len(), 2);
    for p in &preds {
        assert!(p.mean.is_finite());
        if let Some(v) = p.variance {
            assert!(v >= -1e-9);
        }
    }
}
