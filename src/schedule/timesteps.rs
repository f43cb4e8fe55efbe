use crate::options::{GenerationOptions, TimestepSpacing};

use super::NoiseSchedule;

/// `n` evenly spaced values over `[start, end]`, both ends included.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Inference timesteps as real positions, descending.
pub fn spaced_timesteps(spacing: TimestepSpacing, train_timesteps: usize, steps: usize, steps_offset: usize) -> Vec<f64> {
    let last = (train_timesteps - 1) as f64;

    let mut timesteps: Vec<f64> = match spacing {
        TimestepSpacing::Linspace => linspace(0.0, last, steps).into_iter().map(f64::round).collect(),
        TimestepSpacing::Leading => {
            let ratio = (train_timesteps / steps.max(1)) as f64;
            (0..steps)
                .map(|i| (i as f64 * ratio).round() + steps_offset as f64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let ratio = train_timesteps as f64 / steps.max(1) as f64;
            (0..)
                .map(|i| train_timesteps as f64 - i as f64 * ratio)
                .take_while(|&t| t > 1e-9)
                .map(|t| (t.round() - 1.0).max(0.0))
                .collect()
        }
    };

    for t in timesteps.iter_mut() {
        *t = t.min(last);
    }
    timesteps.sort_by(|a, b| b.total_cmp(a));
    timesteps
}

/// Integer timesteps honouring an explicit override list.
pub fn inference_timesteps(options: &GenerationOptions) -> Vec<usize> {
    if !options.timesteps.is_empty() {
        return options.timesteps.clone();
    }

    spaced_timesteps(
        options.timestep_spacing,
        options.train_timesteps,
        options.inference_steps,
        options.steps_offset,
    )
    .into_iter()
    .map(|t| t as usize)
    .collect()
}

/// Piecewise-linear interpolation of `fp` over ascending `xp`, clamped at both ends.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }

    let upper = xp[..n].partition_point(|&v| v <= x);
    let lower = upper - 1;
    let t = (x - xp[lower]) / (xp[upper] - xp[lower]);

    fp[lower] + t * (fp[upper] - fp[lower])
}

/// Karras et al. re-spacing between two sigmas with exponent `rho`.
pub fn karras_sigmas(sigma_min: f64, sigma_max: f64, steps: usize, rho: f64) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);

    (0..steps)
        .map(|i| {
            let ramp = if steps > 1 { i as f64 / (steps - 1) as f64 } else { 0.0 };
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho)
        })
        .collect()
}

/// Fractional timestep whose log sigma matches `sigma`, from an ascending log-sigma table.
pub fn sigma_to_timestep(sigma: f64, log_sigmas: &[f64]) -> f64 {
    if log_sigmas.len() < 2 {
        return 0.0;
    }

    let log_sigma = sigma.max(f64::MIN_POSITIVE).ln();
    let low = log_sigmas[..log_sigmas.len() - 1]
        .iter()
        .rposition(|&l| log_sigma - l >= 0.0)
        .unwrap_or(0);
    let high = low + 1;

    let w = ((log_sigmas[low] - log_sigma) / (log_sigmas[low] - log_sigmas[high])).clamp(0.0, 1.0);

    (1.0 - w) * low as f64 + w * high as f64
}

/// Timesteps and per-step sigmas for sigma-parameterized samplers.
///
/// `sigmas` carries one entry per timestep plus a terminal zero.
#[derive(Debug, Clone)]
pub struct SigmaSchedule {
    pub timesteps: Vec<usize>,
    pub sigmas: Vec<f64>,
    pub init_noise_sigma: f64,
}

impl SigmaSchedule {
    pub fn new(schedule: &NoiseSchedule, options: &GenerationOptions) -> Self {
        Self::with_spacing(schedule, options, options.timestep_spacing)
    }

    pub fn with_spacing(schedule: &NoiseSchedule, options: &GenerationOptions, spacing: TimestepSpacing) -> Self {
        let train_sigmas = schedule.sigmas();
        let range: Vec<f64> = (0..train_sigmas.len()).map(|i| i as f64).collect();

        let mut timesteps: Vec<f64> = if options.timesteps.is_empty() {
            spaced_timesteps(spacing, options.train_timesteps, options.inference_steps, options.steps_offset)
        } else {
            options.timesteps.iter().map(|&t| t as f64).collect()
        };

        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| interp(t, &range, &train_sigmas))
            .collect();

        if options.use_karras_sigmas && !sigmas.is_empty() {
            let log_sigmas = schedule.log_sigmas();
            let sigma_min = sigmas[sigmas.len() - 1];
            let sigma_max = sigmas[0];

            sigmas = karras_sigmas(sigma_min, sigma_max, sigmas.len(), 7.0);
            timesteps = sigmas
                .iter()
                .map(|&s| sigma_to_timestep(s, &log_sigmas).round())
                .collect();
        }

        let max_sigma = sigmas.iter().copied().fold(0.0, f64::max);
        let init_noise_sigma = match spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
            TimestepSpacing::Leading => (max_sigma * max_sigma + 1.0).sqrt(),
        };

        sigmas.push(0.0);

        Self {
            timesteps: timesteps.into_iter().map(|t| t as usize).collect(),
            sigmas,
            init_noise_sigma,
        }
    }
}
