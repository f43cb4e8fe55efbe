use std::cell::{Cell, RefCell};

use burn::backend::ndarray::NdArrayDevice;
use burn::tensor::{backend::Backend, Tensor};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{
    ControlNet, ControlNetInput, Denoiser, DenoiserInput, DiffusionProgress, DiffusionStage, LatentDecoder,
    LatentEncoder, ProgressSink,
};
use crate::tensor::to_vec;

pub type TestBackend = burn::backend::NdArray<f32>;

pub const DEVICE: NdArrayDevice = NdArrayDevice::Cpu;

#[track_caller]
pub fn assert_approx_eq(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {}: {} differs from {} by more than {}",
            i,
            a,
            e,
            tolerance
        );
    }
}

#[derive(Debug, Clone)]
pub struct DenoiserCall {
    pub timestep: f64,
    pub latent_dims: [usize; 4],
    pub batch: usize,
    pub channels: usize,
    pub hidden_batch: usize,
    pub pooled: bool,
    pub time_ids: Option<Vec<f32>>,
    pub guidance_embedding: bool,
    pub control_residuals: usize,
    pub image_conditioning: Option<Vec<f32>>,
    pub image_embeds: Option<Vec<f32>>,
    pub guidance: Option<Vec<f32>>,
    pub image_ids: Option<Vec<f32>>,
    pub text_ids: Option<[usize; 2]>,
}

/// Denoiser returning a constant prediction and recording every call.
#[derive(Debug, Default)]
pub struct CountingDenoiser {
    value: f32,
    output_channels: Option<usize>,
    calls: RefCell<Vec<DenoiserCall>>,
    unloads: Cell<usize>,
}

impl CountingDenoiser {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Fixed output channel count, for denoisers fed extra input channels.
    pub fn with_output_channels(self, channels: usize) -> Self {
        Self {
            output_channels: Some(channels),
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn records(&self) -> Vec<DenoiserCall> {
        self.calls.borrow().clone()
    }

    pub fn unloads(&self) -> usize {
        self.unloads.get()
    }
}

impl<B: Backend> Denoiser<B> for CountingDenoiser {
    fn infer(&self, input: DenoiserInput<B>) -> Result<Tensor<B, 4>> {
        let [batch, channels, height, width] = input.latent.dims();

        self.calls.borrow_mut().push(DenoiserCall {
            timestep: input.timestep,
            latent_dims: [batch, channels, height, width],
            batch,
            channels,
            hidden_batch: input.encoder_hidden_states.dims()[0],
            pooled: input.pooled.is_some(),
            time_ids: input.time_ids.map(to_vec),
            guidance_embedding: input.guidance_embedding.is_some(),
            control_residuals: input.control_residuals.len(),
            image_conditioning: input.image_conditioning.map(to_vec),
            image_embeds: input.image_embeds.map(to_vec),
            guidance: input.guidance.map(to_vec),
            image_ids: input.image_ids.map(to_vec),
            text_ids: input.text_ids.map(|ids| ids.dims()),
        });

        let out_channels = self.output_channels.unwrap_or(channels);
        let device = input.latent.device();
        Ok(Tensor::zeros([batch, out_channels, height, width], &device).add_scalar(self.value))
    }

    fn unload(&self) {
        self.unloads.set(self.unloads.get() + 1);
    }
}

/// Control network returning a single zero residual.
#[derive(Debug, Default)]
pub struct MockControlNet {
    scales: RefCell<Vec<f64>>,
    unloads: Cell<usize>,
}

impl MockControlNet {
    pub fn calls(&self) -> usize {
        self.scales.borrow().len()
    }

    pub fn scales(&self) -> Vec<f64> {
        self.scales.borrow().clone()
    }

    pub fn unloads(&self) -> usize {
        self.unloads.get()
    }
}

impl<B: Backend> ControlNet<B> for MockControlNet {
    fn infer(&self, input: ControlNetInput<B>) -> Result<Vec<Tensor<B, 4>>> {
        self.scales.borrow_mut().push(input.conditioning_scale);
        let device = input.latent.device();
        Ok(vec![Tensor::zeros(input.latent.dims(), &device)])
    }

    fn unload(&self) {
        self.unloads.set(self.unloads.get() + 1);
    }
}

/// Wraps an encoder or decoder, counting calls and unloads.
#[derive(Debug)]
pub struct Tracked<T> {
    pub inner: T,
    calls: Cell<usize>,
    unloads: Cell<usize>,
}

impl<T> Tracked<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
            unloads: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn unloads(&self) -> usize {
        self.unloads.get()
    }
}

impl<B: Backend, T: LatentEncoder<B>> LatentEncoder<B> for Tracked<T> {
    fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        self.calls.set(self.calls.get() + 1);
        self.inner.encode(image)
    }

    fn unload(&self) {
        self.unloads.set(self.unloads.get() + 1);
    }
}

impl<B: Backend, T: LatentDecoder<B>> LatentDecoder<B> for Tracked<T> {
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        self.calls.set(self.calls.get() + 1);
        self.inner.decode(latent)
    }

    fn unload(&self) {
        self.unloads.set(self.unloads.get() + 1);
    }
}

#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub step: usize,
    pub total: usize,
    pub stage: DiffusionStage,
    pub preview: Option<Vec<f32>>,
}

/// Records progress reports, optionally cancelling a token once a given step is reported.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: RefCell<Vec<ProgressRecord>>,
    cancel_at: Option<(usize, CancellationToken)>,
}

impl RecordingSink {
    pub fn cancelling_at(step: usize, token: CancellationToken) -> Self {
        Self {
            cancel_at: Some((step, token)),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ProgressRecord> {
        self.records.borrow().clone()
    }
}

impl<B: Backend> ProgressSink<B> for RecordingSink {
    fn on_progress(&self, progress: DiffusionProgress<B>) {
        if let Some((step, token)) = &self.cancel_at {
            if progress.step == *step {
                token.cancel();
            }
        }

        self.records.borrow_mut().push(ProgressRecord {
            step: progress.step,
            total: progress.total,
            stage: progress.stage,
            preview: progress.preview.map(to_vec),
        });
    }
}
