use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use npy::NpyData;

use crate::error::{DiffusionError, Result};
use crate::tensor::{from_vec, to_vec};

/// Reads a one-dimensional npy array stored as either f64 or f32.
pub fn load_values<P: AsRef<Path>>(path: P) -> Result<Vec<f64>> {
    let bytes = std::fs::read(path.as_ref())?;

    if let Ok(data) = NpyData::<f64>::from_bytes(&bytes) {
        return Ok(data.to_vec());
    }

    let data = NpyData::<f32>::from_bytes(&bytes)?;
    Ok(data.to_vec().into_iter().map(f64::from).collect())
}

pub fn load_tensor<B: Backend, const D: usize, P: AsRef<Path>>(path: P, dims: [usize; D], device: &B::Device) -> Result<Tensor<B, D>> {
    let values: Vec<f32> = load_values(path)?.into_iter().map(|v| v as f32).collect();

    let expected: usize = dims.iter().product();
    if values.len() != expected {
        return Err(DiffusionError::shape_mismatch("npy tensor", &dims, &[values.len()]));
    }

    Ok(from_vec(values, dims, device))
}

/// Trained beta tables ship as one value per training timestep.
pub fn load_trained_betas<P: AsRef<Path>>(path: P, train_timesteps: usize) -> Result<Vec<f64>> {
    let betas = load_values(path)?;
    if betas.len() != train_timesteps {
        return Err(DiffusionError::config(format!(
            "trained betas hold {} values, expected {}",
            betas.len(),
            train_timesteps
        )));
    }

    Ok(betas)
}

pub fn save_values<P: AsRef<Path>>(path: P, values: &[f64]) -> Result<()> {
    npy::to_file(path, values.iter().copied())?;
    Ok(())
}

pub fn save_tensor<B: Backend, const D: usize, P: AsRef<Path>>(path: P, tensor: Tensor<B, D>) -> Result<()> {
    npy::to_file(path, to_vec(tensor))?;
    Ok(())
}
