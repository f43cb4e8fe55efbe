use std::error::Error;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::tensor::Tensor;
use image::{self, ColorType::Rgb8, GrayImage, RgbImage};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use latent_diffusion::backend::{default_device, Backend, Device};
use latent_diffusion::diffuser::{create_diffuser, encode_image, ConditioningInputs, ModelSet};
use latent_diffusion::model::oracle::{OracleDenoiser, OracleTarget};
use latent_diffusion::model::preview::LinearLatentDecoder;
use latent_diffusion::model::{Denoiser, DenoiserInput, DiffusionProgress, PromptEmbeddings};
use latent_diffusion::options::{DiffuserKind, SchedulerKind};
use latent_diffusion::schedule::NoiseSchedule;
use latent_diffusion::tensor::{from_vec, to_signed_range, to_unit_range, to_vec};
use latent_diffusion::{CancellationToken, DiffusionError, GenerationOptions, ModelConfig};

/// Runs a diffusion task end to end with an analytic denoiser that steers every sample
/// toward the latent of a reference image.
#[derive(Debug, StructOpt)]
struct Opts {
    /// Reference image the denoiser steers toward
    #[structopt(parse(from_os_str), short = "r", long)]
    reference_img: PathBuf,

    /// Output PNG path
    #[structopt(parse(from_os_str), short = "o", long)]
    output: PathBuf,

    /// Task: txt2img, img2img, inpaint-legacy
    #[structopt(short = "t", long, default_value = "txt2img")]
    task: DiffuserKind,

    #[structopt(short = "s", long, default_value = "euler-ancestral")]
    scheduler: SchedulerKind,

    /// Number of diffusion iterations
    #[structopt(long, default_value = "30")]
    steps: usize,

    #[structopt(short = "g", long, default_value = "7.5")]
    guidance_scale: f64,

    #[structopt(long, default_value = "0.6")]
    strength: f64,

    #[structopt(long)]
    seed: Option<u64>,

    /// Source image for image-seeded tasks; defaults to the reference image
    #[structopt(parse(from_os_str), long)]
    input_img: Option<PathBuf>,

    /// Grayscale mask, white marks pixels to regenerate
    #[structopt(parse(from_os_str), long)]
    mask: Option<PathBuf>,

    /// Decode in overlapping tiles
    #[structopt(long)]
    tiled: bool,

    /// JSON generation options, overridden by the flags above
    #[structopt(parse(from_os_str), long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::from_args();
    let device = default_device();

    let base = match &opts.config {
        Some(path) => GenerationOptions::load(path)?,
        None => GenerationOptions::new(),
    };

    println!("Loading reference image...");
    let reference = load_image(&opts.reference_img)?;
    let (width, height) = (reference.width() as usize / 8 * 8, reference.height() as usize / 8 * 8);
    let reference = image_to_tensor(&reference, width, height, &device);

    let mut tile = base.tile.clone();
    tile.enabled = tile.enabled || opts.tiled;

    let options = base
        .with_width(width)
        .with_height(height)
        .with_scheduler(opts.scheduler)
        .with_inference_steps(opts.steps)
        .with_guidance_scale(opts.guidance_scale)
        .with_strength(opts.strength)
        .with_seed(opts.seed)
        .with_tile(tile);

    let config = ModelConfig::stable_diffusion();
    let decoder = LinearLatentDecoder::stable_diffusion(config.downscale_factor);
    let encoder = decoder.inverse()?;

    println!("Encoding reference...");
    let encoder_models = ModelSet::new(&config, &NoDenoiser).with_encoder(&encoder);
    let target = encode_image(&encoder_models, &options, reference.clone())?;
    let denoiser = OracleDenoiser::new(target, NoiseSchedule::new(&options)?, OracleTarget::Noise);

    let mut inputs = ConditioningInputs::new();
    if matches!(
        opts.task,
        DiffuserKind::ImageToImage | DiffuserKind::ImageInpaintLegacy | DiffuserKind::ImageInpaint
    ) {
        let source = match &opts.input_img {
            Some(path) => image_to_tensor(&load_image(path)?, width, height, &device),
            None => reference,
        };
        inputs = inputs.with_image(source);
    }
    if let Some(path) = &opts.mask {
        let mask = image::open(path)?.to_luma8();
        inputs = inputs.with_mask(mask_to_tensor(&mask, width, height, &device));
    }

    // prompt embeddings are ignored by the analytic denoiser
    let embeddings = PromptEmbeddings::new(Tensor::zeros([1, 77, 8], &device), Tensor::zeros([1, 77, 8], &device));
    let models = ModelSet::new(&config, &denoiser)
        .with_encoder(&encoder)
        .with_decoder(&decoder);

    println!("Running {:?}...", opts.task);
    let progress = |p: DiffusionProgress<Backend>| println!("Step {}/{} ({:?})", p.step, p.total, p.elapsed);
    let diffuser = create_diffuser::<Backend>(opts.task, config.pipeline)?;
    let images = diffuser.generate(&models, &options, &embeddings, &inputs, &CancellationToken::new(), &progress)?;

    println!("Saving image...");
    save_image(images, &opts.output, width, height)?;
    println!("Done.");

    Ok(())
}

/// Stand-in for encoding only; never asked to denoise.
struct NoDenoiser;

impl Denoiser<Backend> for NoDenoiser {
    fn infer(&self, _input: DenoiserInput<Backend>) -> latent_diffusion::Result<Tensor<Backend, 4>> {
        Err(DiffusionError::MissingInput("denoiser"))
    }
}

fn load_image(path: &Path) -> image::ImageResult<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Top-left `width` x `height` crop as `[1, 3, H, W]` in `[-1, 1]`, edge pixels repeated
/// when the image is smaller.
fn image_to_tensor(image: &RgbImage, width: usize, height: usize, device: &Device) -> Tensor<Backend, 4> {
    let mut values = vec![0.0; 3 * width * height];
    for y in 0..height {
        for x in 0..width {
            let px = (x as u32).min(image.width().saturating_sub(1));
            let py = (y as u32).min(image.height().saturating_sub(1));
            let pixel = image.get_pixel(px, py);
            for c in 0..3 {
                values[c * width * height + y * width + x] = pixel[c] as f32 / 255.0;
            }
        }
    }

    to_signed_range(from_vec(values, [1, 3, height, width], device))
}

fn mask_to_tensor(mask: &GrayImage, width: usize, height: usize, device: &Device) -> Tensor<Backend, 4> {
    let values = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| {
            let x = (x as u32).min(mask.width().saturating_sub(1));
            let y = (y as u32).min(mask.height().saturating_sub(1));
            mask.get_pixel(x, y)[0] as f32 / 255.0
        })
        .collect();

    from_vec(values, [1, 1, height, width], device)
}

fn save_image(images: Tensor<Backend, 4>, path: &Path, width: usize, height: usize) -> image::ImageResult<()> {
    let first = images.slice([0..1]);
    let values = to_vec(to_unit_range(first));
    let plane = width * height;

    let raw: Vec<u8> = (0..plane)
        .flat_map(|i| [values[i], values[plane + i], values[2 * plane + i]])
        .map(|v| (v * 255.0).round() as u8)
        .collect();

    image::save_buffer(path, &raw[..], width as u32, height as u32, Rgb8)
}
