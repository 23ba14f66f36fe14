//! Gradient descent with optional Nesterov momentum, applied on the log
//! scale for covariance/auxiliary parameters and on the natural scale for
//! coefficients. Step halving on a rejected step is *permanent* for
//! gradient descent: once the learning rate shrinks it stays shrunk for
//! the rest of the run, unlike Fisher scoring's fresh full step every
//! iteration.

use crate::options::{FitOptions, NesterovScheduleVersion};

pub struct GdState {
    velocity: Vec<f64>,
    lr_scale: f64,
}

impl GdState {
    pub fn new(n: usize) -> Self {
        Self { velocity: vec![0.0; n], lr_scale: 1.0 }
    }

    pub fn shrink_permanently(&mut self) {
        self.lr_scale *= 0.5;
    }

    /// One Nesterov-accelerated step. Returns the delta to subtract from
    /// the current parameter vector (already signed for a minimizing
    /// update, i.e. `param -= delta`).
    pub fn step(&mut self, grad: &[f64], lr: f64, acc_rate: f64, opts: &FitOptions, iter: usize) -> Vec<f64> {
        let n = grad.len();
        if self.velocity.len() != n {
            self.velocity = vec![0.0; n];
        }
        let momentum = if !opts.use_nesterov || iter < opts.momentum_offset {
            0.0
        } else {
            match opts.nesterov_schedule_version {
                NesterovScheduleVersion::Constant => acc_rate,
                NesterovScheduleVersion::Adaptive => 1.0 - 3.0 / (6.0 + iter as f64),
            }
        };
        let step_lr = lr * self.lr_scale;
        let mut delta = vec![0.0; n];
        for i in 0..n {
            self.velocity[i] = momentum * self.velocity[i] + step_lr * grad[i];
            delta[i] = self.velocity[i];
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FitOptions;

    #[test]
    fn step_moves_in_gradient_direction_scaled_by_lr() {
        let mut gd = GdState::new(2);
        let opts = FitOptions { use_nesterov: false, ..FitOptions::default() };
        let delta = gd.step(&[1.0, -2.0], 0.1, 0.5, &opts, 0);
        assert!((delta[0] - 0.1).abs() < 1e-12);
        assert!((delta[1] - (-0.2)).abs() < 1e-12);
    }

    #[test]
    fn permanent_shrink_persists_across_calls() {
        let mut gd = GdState::new(1);
        let opts = FitOptions { use_nesterov: false, ..FitOptions::default() };
        gd.shrink_permanently();
        let delta = gd.step(&[1.0], 0.1, 0.5, &opts, 0);
        assert!((delta[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn nesterov_adaptive_schedule_ramps_up_after_offset() {
        let mut gd = GdState::new(1);
        let opts = FitOptions { use_nesterov: true, momentum_offset: 2, ..FitOptions::default() };
        gd.step(&[1.0], 0.1, 0.5, &opts, 0);
        let before_offset = gd.velocity[0];
        gd.step(&[1.0], 0.1, 0.5, &opts, 2);
        assert!(gd.velocity[0] > before_offset);
    }
}
