pub mod batch;
pub mod depth;
pub mod model;
pub mod pad;
pub mod schedule;
pub mod trans;
pub mod utils;
pub mod video;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{
    prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    trans::{DepthToImage, PaintRequest},
    utils::{depth_filename, frame_filename, output_filename},
    video::{EncodeOptions, ExtractOptions},
};

/// VAE latent scaling for the SD 2.x autoencoder.
pub const LATENT_SCALE: f64 = 0.18215;

#[derive(Error, Debug)]
pub enum SError {
    #[error("{0}")]
    String(&'static str),
    #[error("can only work with strength in [0.0, 1.0], got {0}")]
    Strength(f64),
    #[error("the number of steps must be at least 1")]
    NoSteps,
    #[error("the number of samples must be at least 1")]
    NoSamples,
    #[error("unsupported depth model type {0:?}")]
    DepthModelType(String),
    #[error("image input {} does not exist", .0.display())]
    MissingImage(PathBuf),
    #[error("video input {} does not exist", .0.display())]
    MissingVideo(PathBuf),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
}

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The prompt steering the generation.
    #[arg(long, default_value = "a cool tree")]
    pub prompt: String,

    /// The image to transform.
    #[arg(long, value_name = "FILE", conflicts_with = "video")]
    pub image: Option<PathBuf>,

    /// The video whose frames get transformed one by one.
    #[arg(long, value_name = "FILE")]
    pub video: Option<PathBuf>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    pub tracing: bool,

    /// The UNet weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub unet_weights: Option<String>,

    /// The CLIP weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub clip_weights: Option<String>,

    /// The VAE weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub vae_weights: Option<String>,

    #[arg(long, value_name = "FILE")]
    /// The file specifying the tokenizer to used for tokenization.
    pub tokenizer: Option<String>,

    /// The DINOv2 backbone weights of the depth estimator.
    #[arg(long, value_name = "FILE")]
    pub dinov2_weights: Option<String>,

    /// The Depth Anything V2 head weights.
    #[arg(long, value_name = "FILE")]
    pub depth_weights: Option<String>,

    /// The depth estimator variant.
    #[arg(long, default_value = "vits")]
    pub depth_model_type: String,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default)
    #[arg(long)]
    pub sliced_attention_size: Option<usize>,

    /// The number of DDIM steps.
    #[arg(long, default_value_t = 100)]
    pub n_steps: usize,

    /// The number of samples to generate per image.
    #[arg(long, default_value_t = 1)]
    pub num_samples: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.0)]
    pub guidance_scale: f64,

    /// The strength, indicates how much to transform the initial image. The
    /// value must be between 0 and 1, a value of 1 discards the initial image
    /// information.
    #[arg(long, default_value_t = 0.55)]
    pub strength: f64,

    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// DDIM eta, 0 gives deterministic sampling.
    #[arg(long, default_value_t = 0.0)]
    pub eta: f64,

    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "depth2video")]
    pub batch_name: String,

    /// Write the depth preview next to every output image.
    #[arg(long)]
    pub save_depth: bool,

    /// Keep frames extracted by a previous run instead of extracting again.
    #[arg(long)]
    pub keep_extracted_frames: bool,

    /// Only keep every nth frame of the input video.
    #[arg(long, default_value_t = 1)]
    pub extract_nth_frame: usize,

    /// Width the video frames are resized to.
    #[arg(long, default_value_t = 512)]
    pub frame_width: u32,

    /// Height the video frames are resized to.
    #[arg(long, default_value_t = 512)]
    pub frame_height: u32,

    #[arg(long, default_value_t = 12.0)]
    pub fps: f64,

    /// Upper bound on the number of frames in the encoded video.
    #[arg(long, default_value_t = 10_000)]
    pub max_frames: usize,

    /// Do not assemble the output frames into a video.
    #[arg(long)]
    pub skip_video: bool,

    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    #[arg(long)]
    pub use_flash_attn: bool,

    #[arg(long)]
    pub use_f16: bool,
}

impl Args {
    /// Rejects invalid parameters before any weights get loaded.
    pub fn check(&self) -> Result<()> {
        if !(0. ..=1.).contains(&self.strength) {
            return Err(SError::Strength(self.strength).into());
        }
        if self.n_steps == 0 {
            return Err(SError::NoSteps.into());
        }
        if self.num_samples == 0 {
            return Err(SError::NoSamples.into());
        }
        if self.extract_nth_frame == 0 {
            anyhow::bail!("extract-nth-frame should be at least 1")
        }
        match (&self.image, &self.video) {
            (Some(image), _) if !image.exists() => {
                return Err(SError::MissingImage(image.clone()).into());
            }
            (None, Some(video)) if !video.exists() && !self.reuses_frames() => {
                return Err(SError::MissingVideo(video.clone()).into());
            }
            (None, None) => anyhow::bail!("one of --image or --video is required"),
            _ => {}
        }
        Ok(())
    }

    fn batch_dir(&self) -> PathBuf {
        self.output_dir.join(&self.batch_name)
    }

    fn frames_dir(&self) -> PathBuf {
        self.batch_dir().join("inputframes")
    }

    /// Frames from an earlier extraction are used instead of the video.
    fn reuses_frames(&self) -> bool {
        self.keep_extracted_frames && self.frames_dir().exists()
    }

    /// Encoder settings for `painted` output frames. Frames numbered past
    /// `painted` belong to earlier runs and are never read.
    fn encode_options(&self, painted: usize) -> EncodeOptions {
        EncodeOptions {
            ffmpeg: self.ffmpeg.clone(),
            fps: self.fps,
            start_number: 1,
            pattern: self
                .batch_dir()
                .join(format!("{}_%05d.png", self.batch_name)),
            max_frames: self.max_frames.min(painted),
            crf: 17,
            output: self.output_dir.join(format!("{}.mp4", self.batch_name)),
        }
    }

    fn paint_request(&self) -> PaintRequest {
        PaintRequest {
            prompt: self.prompt.clone(),
            steps: self.n_steps,
            num_samples: self.num_samples,
            scale: self.guidance_scale,
            seed: self.seed,
            eta: self.eta,
            strength: self.strength,
        }
    }
}

/// Installs the fmt subscriber, plus the chrome layer when `chrome` is set. The
/// returned guard flushes the chrome trace on drop.
pub fn init_tracing(chrome: bool) -> Option<FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(fmt).init();
        None
    }
}

pub fn run(args: Args) -> Result<()> {
    args.check()?;
    let _guard = init_tracing(args.tracing);

    let mut component = DepthToImage::new(&args)?;
    std::fs::create_dir_all(&args.output_dir)?;

    match (&args.image, &args.video) {
        (Some(image), _) => run_image(&mut component, &args, image),
        (None, Some(video)) => run_video(&mut component, &args, video),
        (None, None) => Err(SError::String("no input given").into()),
    }
}

fn run_image(component: &mut DepthToImage, args: &Args, path: &Path) -> Result<()> {
    let image = image::io::Reader::open(path)?.decode()?.to_rgb8();
    let painting = component.predict(&image, &args.paint_request())?;

    let basename = format!("{}.png", args.batch_name);
    for (idx, sample) in painting.samples.iter().enumerate() {
        let filename = args
            .output_dir
            .join(output_filename(&basename, idx + 1));
        sample.save(&filename)?;
        info!("saved {}", filename.display());
    }
    let depth_path = args.output_dir.join(format!("{}_depth.png", args.batch_name));
    painting.depth.save(&depth_path)?;
    info!("saved {}", depth_path.display());
    Ok(())
}

fn run_video(component: &mut DepthToImage, args: &Args, video: &Path) -> Result<()> {
    let batch_dir = args.batch_dir();
    let frames_dir = args.frames_dir();
    let options = ExtractOptions {
        every_nth: args.extract_nth_frame,
        width: args.frame_width,
        height: args.frame_height,
        overwrite: !args.keep_extracted_frames,
        extension: "jpg".to_string(),
        ffmpeg: args.ffmpeg.clone(),
    };
    video::extract_frames(video, &frames_dir, &options)?;
    let frames = video::list_frames(&frames_dir, &options.extension)?;
    info!("transforming {} frames", frames.len());

    let request = args.paint_request();
    for (idx, frame) in frames.iter().enumerate() {
        let frame_idx = idx + 1;
        info!("frame {frame_idx}/{}", frames.len());
        let image = image::io::Reader::open(frame)?.decode()?.to_rgb8();
        let painting = component.predict(&image, &request)?;
        let sample = painting
            .samples
            .first()
            .ok_or(SError::String("sampler returned no image"))?;
        sample.save(batch_dir.join(frame_filename(&args.batch_name, frame_idx)))?;
        if args.save_depth {
            painting
                .depth
                .save(batch_dir.join(depth_filename(&args.batch_name, frame_idx)))?;
        }
    }

    if args.skip_video || frames.is_empty() {
        return Ok(());
    }
    let encode = args.encode_options(frames.len());
    let output = video::encode_video(&encode)?;
    info!("video written to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn args_with(input: &NamedTempFile, extra: &[&str]) -> Args {
        let path = input.path().to_string_lossy().into_owned();
        let mut argv = vec!["depth2video", "--image", path.as_str()];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn parsed(extra: &[&str]) -> (NamedTempFile, Args) {
        let input = NamedTempFile::new().unwrap();
        let args = args_with(&input, extra);
        (input, args)
    }

    #[test]
    fn defaults_match_script_constants() {
        let (_input, args) = parsed(&[]);
        assert_eq!(args.prompt, "a cool tree");
        assert_eq!(args.n_steps, 100);
        assert_eq!(args.guidance_scale, 7.0);
        assert_eq!(args.strength, 0.55);
        assert_eq!(args.seed, 1);
        assert_eq!(args.eta, 0.0);
        assert_eq!(args.num_samples, 1);
        assert!(args.check().is_ok());
    }

    #[test]
    fn strength_is_checked_before_loading() {
        let input = NamedTempFile::new().unwrap();
        let err = args_with(&input, &["--strength", "1.5"]).check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SError>(),
            Some(SError::Strength(s)) if *s == 1.5
        ));
        assert!(args_with(&input, &["--strength=-0.1"]).check().is_err());
        assert!(args_with(&input, &["--strength", "1"]).check().is_ok());
        assert!(args_with(&input, &["--strength", "0"]).check().is_ok());
    }

    #[test]
    fn zero_counts_are_rejected() {
        let input = NamedTempFile::new().unwrap();
        assert!(args_with(&input, &["--n-steps", "0"]).check().is_err());
        assert!(args_with(&input, &["--num-samples", "0"]).check().is_err());
        assert!(args_with(&input, &["--extract-nth-frame", "0"])
            .check()
            .is_err());
    }

    #[test]
    fn an_input_is_required() {
        let args = Args::parse_from(["depth2video"]);
        assert!(args.check().is_err());
    }

    #[test]
    fn missing_inputs_are_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("missing.png");
        let args = Args::parse_from(["depth2video", "--image", image.to_str().unwrap()]);
        assert!(matches!(
            args.check().unwrap_err().downcast_ref::<SError>(),
            Some(SError::MissingImage(p)) if *p == image
        ));

        let video = dir.path().join("missing.mp4");
        let out = dir.path().join("out");
        let argv = [
            "depth2video",
            "--video",
            video.to_str().unwrap(),
            "--output-dir",
            out.to_str().unwrap(),
            "--batch-name",
            "tree",
            "--keep-extracted-frames",
        ];
        let args = Args::parse_from(argv);
        assert!(matches!(
            args.check().unwrap_err().downcast_ref::<SError>(),
            Some(SError::MissingVideo(_))
        ));

        // previously extracted frames stand in for the video
        std::fs::create_dir_all(out.join("tree").join("inputframes")).unwrap();
        assert!(args.check().is_ok());
        let args = Args::parse_from(argv[..argv.len() - 1].iter().copied());
        assert!(args.check().is_err());
    }

    #[test]
    fn encoder_reads_only_the_painted_frames() {
        let (_input, args) = parsed(&["--batch-name", "tree", "--output-dir", "out"]);
        let encode = args.encode_options(50);
        assert_eq!(encode.max_frames, 50);
        assert_eq!(encode.start_number, 1);
        assert_eq!(encode.pattern, Path::new("out/tree/tree_%05d.png"));
        assert_eq!(encode.output, Path::new("out/tree.mp4"));
        let argv = video::encoder_args(&encode);
        let pos = argv.iter().position(|a| a == "-frames:v").unwrap();
        assert_eq!(argv[pos + 1], "50");

        let (_input, args) = parsed(&["--max-frames", "20"]);
        assert_eq!(args.encode_options(50).max_frames, 20);
    }
}
