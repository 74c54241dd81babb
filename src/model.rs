use std::path::PathBuf;

use anyhow::Result;
use hf_hub::api::sync::Api;
use tracing::debug;

/// Diffusers layout of the depth-conditioned Stable Diffusion 2 checkpoint.
pub const DEPTH_SD_REPO: &str = "stabilityai/stable-diffusion-2-depth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Tokenizer,
    Clip,
    Unet,
    Vae,
    DinoV2,
    DepthAnything,
}

impl ModelFile {
    fn location(&self, use_f16: bool) -> (&'static str, &'static str) {
        match self {
            Self::Tokenizer => ("openai/clip-vit-base-patch32", "tokenizer.json"),
            Self::Clip => {
                if use_f16 {
                    (DEPTH_SD_REPO, "text_encoder/model.fp16.safetensors")
                } else {
                    (DEPTH_SD_REPO, "text_encoder/model.safetensors")
                }
            }
            Self::Unet => {
                if use_f16 {
                    (DEPTH_SD_REPO, "unet/diffusion_pytorch_model.fp16.safetensors")
                } else {
                    (DEPTH_SD_REPO, "unet/diffusion_pytorch_model.safetensors")
                }
            }
            Self::Vae => {
                if use_f16 {
                    (DEPTH_SD_REPO, "vae/diffusion_pytorch_model.fp16.safetensors")
                } else {
                    (DEPTH_SD_REPO, "vae/diffusion_pytorch_model.safetensors")
                }
            }
            // The depth estimator always runs in f32.
            Self::DinoV2 => ("lmz/candle-dino-v2", "dinov2_vits14.safetensors"),
            Self::DepthAnything => (
                "jeroenvlek/depth-anything-v2-safetensors",
                "depth_anything_v2_vits.safetensors",
            ),
        }
    }

    /// Returns `filename` when given, otherwise fetches the file from the hub.
    pub fn get(&self, filename: Option<String>, use_f16: bool) -> Result<PathBuf> {
        match filename {
            Some(filename) => Ok(PathBuf::from(filename)),
            None => {
                let (repo, path) = self.location(use_f16);
                debug!("fetching {path} from {repo}");
                let filename = Api::new()?.model(repo.to_string()).get(path)?;
                Ok(filename)
            }
        }
    }
}
