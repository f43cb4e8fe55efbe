pub mod timesteps;

pub use timesteps::{
    interp, inference_timesteps, karras_sigmas, linspace, sigma_to_timestep, spaced_timesteps, SigmaSchedule,
};

use std::f64::consts::PI;

use crate::error::{DiffusionError, Result};
use crate::options::{AlphaTransform, BetaSchedule, GenerationOptions};

/// Training-time noise constants, one entry per training timestep.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let betas = match &options.trained_betas {
            Some(betas) => betas.clone(),
            None => beta_schedule(
                options.beta_schedule,
                options.beta_start,
                options.beta_end,
                options.train_timesteps,
                options.alpha_transform,
                options.maximum_beta,
            ),
        };

        Self::from_betas(betas)
    }

    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(DiffusionError::config("beta schedule is empty"));
        }
        if let Some(beta) = betas.iter().find(|b| !(b.is_finite() && **b > 0.0 && **b < 1.0)) {
            return Err(DiffusionError::config(format!("beta {} lies outside (0, 1)", beta)));
        }

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod = alphas
            .iter()
            .scan(1.0, |prod, alpha| {
                *prod *= alpha;
                Some(*prod)
            })
            .collect();

        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
        })
    }

    pub fn train_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// Cumulative alpha at a timestep, clamped into the table.
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        let index = timestep.min(self.alphas_cumprod.len() - 1);
        self.alphas_cumprod[index]
    }

    /// `sqrt((1 - alpha_cumprod) / alpha_cumprod)` per training timestep.
    pub fn sigmas(&self) -> Vec<f64> {
        self.alphas_cumprod
            .iter()
            .map(|a| ((1.0 - a) / a).sqrt())
            .collect()
    }

    pub fn log_sigmas(&self) -> Vec<f64> {
        self.sigmas().into_iter().map(f64::ln).collect()
    }
}

pub fn beta_schedule(
    kind: BetaSchedule,
    beta_start: f64,
    beta_end: f64,
    train_timesteps: usize,
    alpha_transform: AlphaTransform,
    maximum_beta: f64,
) -> Vec<f64> {
    match kind {
        BetaSchedule::Linear => linspace(beta_start, beta_end, train_timesteps),
        BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), train_timesteps)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaSchedule::SquaredCosCapV2 => betas_for_alpha_bar(train_timesteps, alpha_transform, maximum_beta),
        BetaSchedule::Sigmoid => linspace(-6.0, 6.0, train_timesteps)
            .into_iter()
            .map(|x| 1.0 / (1.0 + (-x).exp()) * (beta_end - beta_start) + beta_start)
            .collect(),
    }
}

pub fn alpha_bar(transform: AlphaTransform, t: f64) -> f64 {
    match transform {
        AlphaTransform::Cosine => ((t + 0.008) / 1.008 * PI / 2.0).cos().powi(2),
        AlphaTransform::Exponential => (t * -12.0).exp(),
    }
}

/// Betas that discretize a continuous alpha-bar function, capped at `maximum_beta`.
pub fn betas_for_alpha_bar(train_timesteps: usize, transform: AlphaTransform, maximum_beta: f64) -> Vec<f64> {
    (0..train_timesteps)
        .map(|i| {
            let t1 = i as f64 / train_timesteps as f64;
            let t2 = (i + 1) as f64 / train_timesteps as f64;
            let beta = (1.0 - alpha_bar(transform, t2) / alpha_bar(transform, t1)).min(maximum_beta);
            beta.max(0.0001)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [BetaSchedule; 4] = [
        BetaSchedule::Linear,
        BetaSchedule::ScaledLinear,
        BetaSchedule::SquaredCosCapV2,
        BetaSchedule::Sigmoid,
    ];

    fn schedule(kind: BetaSchedule) -> NoiseSchedule {
        let options = GenerationOptions::new().with_beta_schedule(kind);
        NoiseSchedule::new(&options).unwrap()
    }

    #[test]
    fn alpha_cumprod_is_non_increasing_and_bounded() {
        for kind in KINDS {
            let schedule = schedule(kind);
            assert_eq!(schedule.train_timesteps(), 1000);

            for pair in schedule.alphas_cumprod.windows(2) {
                assert!(pair[1] <= pair[0], "{:?}", kind);
            }
            assert!(schedule.alphas_cumprod.iter().all(|&a| a > 0.0 && a <= 1.0), "{:?}", kind);
        }
    }

    #[test]
    fn raw_sigmas_are_non_negative_and_non_decreasing() {
        for kind in KINDS {
            let sigmas = schedule(kind).sigmas();

            assert!(sigmas.iter().all(|&s| s >= 0.0));
            for pair in sigmas.windows(2) {
                assert!(pair[1] >= pair[0], "{:?}", kind);
            }
        }
    }

    #[test]
    fn linear_endpoints() {
        let betas = beta_schedule(BetaSchedule::Linear, 0.0001, 0.02, 1000, AlphaTransform::Cosine, 0.999);

        assert!((betas[0] - 0.0001).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
        assert!((betas[1] - (0.0001 + 0.0199 / 999.0)).abs() < 1e-12);
    }

    #[test]
    fn scaled_linear_squares_the_root_ramp() {
        let betas = beta_schedule(BetaSchedule::ScaledLinear, 0.00085, 0.012, 1000, AlphaTransform::Cosine, 0.999);
        let mid = (0.00085f64.sqrt() + (0.012f64.sqrt() - 0.00085f64.sqrt()) * 500.0 / 999.0).powi(2);

        assert!((betas[0] - 0.00085).abs() < 1e-12);
        assert!((betas[500] - mid).abs() < 1e-12);
    }

    #[test]
    fn cosine_betas_are_capped() {
        let betas = betas_for_alpha_bar(1000, AlphaTransform::Cosine, 0.999);

        assert!(betas.iter().all(|&b| b >= 0.0001 && b <= 0.999));
        assert!((betas[999] - 0.999).abs() < 1e-12);

        let exponential = betas_for_alpha_bar(1000, AlphaTransform::Exponential, 0.999);
        let expected = 1.0 - (-12.0f64 / 1000.0).exp();
        assert!((exponential[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn trained_betas_override_the_schedule() {
        let betas = vec![0.1; 10];
        let options = GenerationOptions::new()
            .with_train_timesteps(10)
            .with_trained_betas(Some(betas));
        let schedule = NoiseSchedule::new(&options).unwrap();

        assert!((schedule.alphas_cumprod[1] - 0.81).abs() < 1e-12);
    }

    #[test]
    fn rejects_degenerate_betas() {
        assert!(NoiseSchedule::from_betas(vec![]).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.1, 1.0]).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.1, f64::NAN]).is_err());
    }
}
