use anyhow::Result;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{PredictionType, Scheduler, SchedulerConfig},
};
use tracing::info;

use crate::SError;

/// Where denoising starts for a given strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrengthSchedule {
    /// Number of denoising iterations, always below the step count.
    pub t_enc: usize,
    /// Start from pure noise instead of the noised input latent.
    pub full_sample: bool,
}

impl StrengthSchedule {
    pub fn new(strength: f64, steps: usize) -> Result<Self, SError> {
        if !(0. ..=1.).contains(&strength) {
            return Err(SError::Strength(strength));
        }
        if steps == 0 {
            return Err(SError::NoSteps);
        }
        let t_enc = ((strength * steps as f64).floor() as usize).min(steps - 1);
        Ok(Self {
            t_enc,
            full_sample: strength == 1.,
        })
    }

    /// Index into the (descending) scheduler timesteps of the first iteration.
    pub fn start_index(&self, steps: usize) -> usize {
        steps - self.t_enc
    }
}

/// DDIM schedule shared by every call, rebuilt only when its parameters change.
pub struct Sampler {
    n_steps: usize,
    eta: f64,
    scheduler: Box<dyn Scheduler>,
}

impl Sampler {
    pub fn new(n_steps: usize, eta: f64) -> Result<Self> {
        Ok(Self {
            n_steps,
            eta,
            scheduler: build_scheduler(n_steps, eta)?,
        })
    }

    pub fn make_schedule(&mut self, n_steps: usize, eta: f64) -> Result<()> {
        if n_steps == 0 {
            return Err(SError::NoSteps.into());
        }
        if n_steps != self.n_steps || eta != self.eta {
            info!("rebuilding the DDIM schedule for {n_steps} steps, eta {eta}");
            self.scheduler = build_scheduler(n_steps, eta)?;
            self.n_steps = n_steps;
            self.eta = eta;
        }
        Ok(())
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn scheduler_mut(&mut self) -> &mut dyn Scheduler {
        self.scheduler.as_mut()
    }
}

// https://huggingface.co/stabilityai/stable-diffusion-2-depth/blob/main/scheduler/scheduler_config.json
fn build_scheduler(n_steps: usize, eta: f64) -> Result<Box<dyn Scheduler>> {
    let config = DDIMSchedulerConfig {
        prediction_type: PredictionType::Epsilon,
        eta,
        ..Default::default()
    };
    Ok(config.build(n_steps)?)
}
