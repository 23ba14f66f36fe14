//! One grouped random intercept, Gaussian response: the simplest full
//! pipeline (structure planning -> Woodbury-free single-component RE-scale
//! path -> Laplace solve -> outer fit -> prediction).

use gprem::{Engine, FitOptions, GroupedSpec, ModelSpec, PathPreference, PredictOptions};
use gprem::engine::PredictionRow;
use gprem::predictor::ComponentQuery;

fn simulate(n_groups: usize, per_group: usize) -> (Vec<i64>, Vec<f64>) {
    let mut group_ids = Vec::new();
    let mut y = Vec::new();
    for g in 0..n_groups {
        let group_effect = if g % 2 == 0 { 1.0 } else { -1.0 };
        for i in 0..per_group {
            group_ids.push(g as i64);
            let noise = ((i * 7 + g * 13) % 11) as f64 / 11.0 - 0.5;
            y.push(group_effect + noise);
        }
    }
    (group_ids, y)
}

#[test]
fn fit_decreases_negative_log_likelihood_and_predicts_finite_values() {
    let (group_ids, y) = simulate(10, 8);
    let n = y.len();

    let spec = ModelSpec {
        cluster_ids: vec![0; n],
        grouped: vec![GroupedSpec { group_ids: group_ids.clone(), coefficient: None, initial_variance: 1.0 }],
        gp: vec![],
        likelihood: "gaussian".into(),
        path_preference: PathPreference::Dense,
    };

    let mut engine = Engine::create(&spec, FitOptions::default(), PredictOptions::default()).unwrap();
    engine.set_response(&y).unwrap();

    let initial_neg_ll = engine.neg_log_likelihood(&[]).unwrap();
    assert!(initial_neg_ll.is_finite());

    let summary = engine.fit().unwrap();
    assert!(summary.neg_log_likelihood.is_finite());
    assert!(summary.neg_log_likelihood <= initial_neg_ll + 1e-6);
    assert!(summary.cov_pars.iter().all(|&p| p > 0.0));
    assert!(summary.aux_pars.iter().all(|&p| p > 0.0));

    engine.set_prediction_data(vec![
        PredictionRow { cluster_id: 0, queries: vec![ComponentQuery::GroupedLevel(Some(0))], fixed_offset: 0.0, covariates: None },
        PredictionRow { cluster_id: 0, queries: vec![ComponentQuery::GroupedLevel(None)], fixed_offset: 0.0, covariates: None },
    ]);
    let preds = engine.predict().unwrap();
    assert_eq!(preds.len(), 2);
    for p in &preds {
        assert!(p.mean.is_finite());
        if let Some(v) = p.variance {
            assert!(v >= 0.0);
        }
    }
}

#[test]
fn find_init_cov_pars_gives_one_positive_value_per_component() {
    let (group_ids, y) = simulate(6, 5);
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
    let init = engine.find_init_cov_pars().unwrap();
    assert_eq!(init.len(), 1);
    assert!(init[0] > 0.0);
}
