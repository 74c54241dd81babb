use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};

use crate::{
    batch::make_batch,
    depth::{depth_condition, DepthEstimator, DepthTransform},
    model::ModelFile,
    pad::pad_image,
    schedule::{Sampler, StrengthSchedule},
    utils::{device, tensor_to_images},
    Args, LATENT_SCALE,
};
use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Module, Tensor};
use image::{GrayImage, RgbImage};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Latent channels of the autoencoder; the UNet gets one extra depth channel.
const LATENT_CHANNELS: usize = 4;
const DEPTH_CHANNELS: usize = 1;

#[derive(Debug, Clone)]
pub struct PaintRequest {
    pub prompt: String,
    pub steps: usize,
    pub num_samples: usize,
    pub scale: f64,
    pub seed: u64,
    pub eta: f64,
    pub strength: f64,
}

/// Depth preview of the input plus one image per sample.
pub struct Painting {
    pub depth: GrayImage,
    pub samples: Vec<RgbImage>,
}

/// Concat conditioning shared by both halves, cross-attention conditioning
/// stacked as (unconditional, conditional).
struct Conditioning {
    concat: Tensor,
    crossattn: Tensor,
}

pub struct DepthToImage {
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_position_embeddings: usize,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    depth_model: DepthEstimator,
    depth_transform: DepthTransform,
    sampler: Sampler,
    device: Device,
}

impl DepthToImage {
    pub fn new(args: &Args) -> Result<Self> {
        let dtype = if args.use_f16 { DType::F16 } else { DType::F32 };
        // The depth UNet shares the 2.1 architecture, only its input width differs.
        let sd_config = StableDiffusionConfig::v2_1(args.sliced_attention_size, None, None);
        let device = device(args.cpu)?;
        let depth_transform = DepthTransform::new(&args.depth_model_type)?;

        let tokenizer = ModelFile::Tokenizer.get(args.tokenizer.clone(), args.use_f16)?;
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(E::msg)?;
        let pad_with = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_with)
            .ok_or_else(|| E::msg(format!("tokenizer has no {pad_with:?} token")))?;

        info!("Building the Clip transformer.");
        let clip_weights = ModelFile::Clip.get(args.clip_weights.clone(), false)?;
        let text_model = build_clip_transformer(&sd_config.clip, clip_weights, &device, DType::F32)?;

        info!("Building the autoencoder.");
        let vae_weights = ModelFile::Vae.get(args.vae_weights.clone(), args.use_f16)?;
        let vae = sd_config.build_vae(vae_weights, &device, dtype)?;

        info!("Building the unet.");
        let unet_weights = ModelFile::Unet.get(args.unet_weights.clone(), args.use_f16)?;
        let unet = sd_config.build_unet(
            unet_weights,
            &device,
            LATENT_CHANNELS + DEPTH_CHANNELS,
            args.use_flash_attn,
            dtype,
        )?;

        info!("Building the depth estimator.");
        let dinov2_weights = ModelFile::DinoV2.get(args.dinov2_weights.clone(), false)?;
        let depth_weights = ModelFile::DepthAnything.get(args.depth_weights.clone(), false)?;
        let depth_model = DepthEstimator::new(
            dinov2_weights,
            depth_weights,
            depth_transform.model_type(),
            &device,
        )?;

        let sampler = Sampler::new(args.n_steps, args.eta)?;

        Ok(Self {
            dtype,
            tokenizer,
            pad_id,
            max_position_embeddings: sd_config.clip.max_position_embeddings,
            text_model,
            vae,
            unet,
            depth_model,
            depth_transform,
            sampler,
            device,
        })
    }

    /// Pads `image`, validates the strength and samples.
    pub fn predict(&mut self, image: &RgbImage, request: &PaintRequest) -> Result<Painting> {
        let image = pad_image(image);
        self.sampler.make_schedule(request.steps, request.eta)?;
        let schedule = StrengthSchedule::new(request.strength, request.steps)?;
        debug!(
            "strength {} gives t_enc {}, full sample {}",
            request.strength, schedule.t_enc, schedule.full_sample
        );
        self.paint(&image, request, schedule)
    }

    fn paint(
        &mut self,
        image: &RgbImage,
        request: &PaintRequest,
        schedule: StrengthSchedule,
    ) -> Result<Painting> {
        let mut rng = StdRng::seed_from_u64(request.seed);
        if !self.device.is_cpu() {
            self.device.set_seed(request.seed)?;
        }

        let batch = make_batch(
            image,
            &request.prompt,
            request.num_samples,
            &self.depth_transform,
            &self.device,
        )?;
        let n = batch.num_samples();

        let z = (self
            .vae
            .encode(&batch.image.to_dtype(self.dtype)?)?
            .sample()?
            * LATENT_SCALE)?;
        let (_, _, latent_h, latent_w) = z.dims4()?;

        let c = self.text_embeddings(&batch.prompts[0])?.repeat((n, 1, 1))?;
        let uc = self.text_embeddings("")?.repeat((n, 1, 1))?;

        let depth = self.depth_model.forward(&batch.depth_input)?;
        let depth = depth_condition(&depth, latent_h, latent_w)?;
        let cond = Conditioning {
            concat: depth.cond.to_dtype(self.dtype)?,
            crossattn: Tensor::cat(&[uc, c], 0)?.to_dtype(self.dtype)?,
        };

        let scheduler = self.sampler.scheduler();
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = schedule.start_index(self.sampler.n_steps());
        let mut latents = if schedule.full_sample {
            (self.randn(&mut rng, z.dims())? * scheduler.init_noise_sigma())?
        } else if t_start < timesteps.len() {
            let noise = self.randn(&mut rng, z.dims())?;
            scheduler.add_noise(&z, noise, timesteps[t_start])?
        } else {
            z
        };
        latents = latents.to_dtype(self.dtype)?;

        info!("running {} DDIM steps", timesteps.len().saturating_sub(t_start));
        for (timestep_index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            latents = self.step(timestep_index, timestep, latents, &cond, request.scale)?;
        }

        let images = self.vae.decode(&(&latents / LATENT_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        Ok(Painting {
            depth: depth.preview,
            samples: tensor_to_images(&images)?,
        })
    }

    fn step(
        &mut self,
        timestep_index: usize,
        timestep: usize,
        latents: Tensor,
        cond: &Conditioning,
        scale: f64,
    ) -> Result<Tensor> {
        let start_time = std::time::Instant::now();
        let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
        let latent_model_input = self.sampler.scheduler().scale_model_input(latent_model_input, timestep)?;
        let concat = Tensor::cat(&[&cond.concat, &cond.concat], 0)?;
        let latent_model_input = Tensor::cat(&[&latent_model_input, &concat], 1)?;

        let noise_pred = self
            .unet
            .forward(&latent_model_input, timestep as f64, &cond.crossattn)?;
        let noise_pred = noise_pred.chunk(2, 0)?;
        let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
        let noise_pred = (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * scale)?)?;
        let latents = self.sampler.scheduler_mut().step(&noise_pred, timestep, &latents)?;
        let dt = start_time.elapsed().as_secs_f32();
        debug!(
            "step {}/{} done, {:.2}s",
            timestep_index + 1,
            self.sampler.n_steps(),
            dt
        );
        Ok(latents)
    }

    /// CLIP embedding of `prompt`, shape (1, max_position_embeddings, dim).
    fn text_embeddings(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_position_embeddings);
        while tokens.len() < self.max_position_embeddings {
            tokens.push(self.pad_id)
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Host-seeded standard normal noise, moved to the model device.
    fn randn(&self, rng: &mut StdRng, dims: &[usize]) -> Result<Tensor> {
        let count = dims.iter().product::<usize>();
        let values: Vec<f32> = (0..count).map(|_| StandardNormal.sample(rng)).collect();
        let noise = Tensor::from_vec(values, dims, &Device::Cpu)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        Ok(noise)
    }
}
