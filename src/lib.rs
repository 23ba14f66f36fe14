//! Latent-variable inference engine for Gaussian process and mixed-effects
//! regression. A latent field is built up from additive grouped
//! (random-intercept/random-coefficient) and Gaussian-process components,
//! a likelihood links it to the observed response, and a Laplace
//! approximation to the marginal likelihood is optimized over covariance,
//! auxiliary, and fixed-effect parameters.
//!
//! [`engine::Engine`] is the entry point: lay out components with
//! [`engine::Engine::create`], attach data, call [`engine::Engine::fit`],
//! then [`engine::Engine::predict`].

pub mod cluster;
pub mod component;
pub mod covariance;
pub mod engine;
pub mod error;
pub mod gradient;
pub mod kernel;
pub mod laplace;
pub mod likelihood;
pub mod linalg;
pub mod optimizer;
pub mod options;
pub mod predictor;
pub mod rng;
pub mod structure;

pub use engine::{Engine, FitSummary, GpSpec, GroupedSpec, ModelSpec, PredictionRow};
pub use error::{GpremError, Result};
pub use kernel::Kernel;
pub use likelihood::Likelihood;
pub use options::{FitOptions, OptimizerKind, PredictOptions};
pub use predictor::{ComponentQuery, LatentPrediction};
pub use structure::PathPreference;
