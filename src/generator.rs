//! Form state for one generation request and the invoker that submits it.

use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, GenerationApi};
use crate::model::generation::{GenerationRequest, ImageMetadata, Upscale};

/// Client-side random seeds are drawn from `[0, SEED_RANGE)`.
pub const SEED_RANGE: u64 = 1_000_000;
pub const STEPS_RANGE: RangeInclusive<u32> = 4..=50;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 1.0..=20.0;
pub const DIMENSION_RANGE: RangeInclusive<u32> = 256..=1024;
pub const DIMENSION_STEP: u32 = 64;
pub const LORA_SCALE_RANGE: RangeInclusive<f64> = 0.1..=1.0;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, ugly";
pub const DEFAULT_SAMPLER: &str = "DPM++ 2M";
pub const DEFAULT_LORA_SCALE: f64 = 0.75;
pub const SAMPLERS: [&str; 7] = [
    "DPM++ 2M",
    "DPM++ 2M Karras",
    "Euler",
    "Euler A",
    "Heun",
    "LMS",
    "LMS Karras",
];

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("a generation is already in progress")]
    Busy,
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl GenerateError {
    pub fn user_message(&self) -> String {
        match self {
            GenerateError::Api(e) => e.user_message("Error generating image"),
            other => other.to_string(),
        }
    }
}

pub trait SeedSource {
    /// A raw draw; only the remainder modulo [`SEED_RANGE`] is used.
    /// [`RandomSeed`] already draws inside the range.
    fn draw(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSeed;

impl SeedSource for RandomSeed {
    fn draw(&self) -> u64 {
        rand::thread_rng().gen_range(0..SEED_RANGE)
    }
}

/// A zero seed means "pick one": resolve it here so the backend, and the
/// metadata it records, only ever see the seed actually used.
pub fn resolve_seed<S: SeedSource + ?Sized>(entered: u64, seeds: &S) -> u64 {
    if entered != 0 {
        return entered;
    }
    loop {
        let seed = seeds.draw() % SEED_RANGE;
        if seed != 0 {
            return seed;
        }
    }
}

fn snap_dimension(value: u32) -> u32 {
    let snapped = value.saturating_add(DIMENSION_STEP / 2) / DIMENSION_STEP * DIMENSION_STEP;
    snapped.clamp(*DIMENSION_RANGE.start(), *DIMENSION_RANGE.end())
}

fn clamp_f64(value: f64, range: &RangeInclusive<f64>, current: f64) -> f64 {
    if value.is_finite() {
        value.clamp(*range.start(), *range.end())
    } else {
        current
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorForm {
    prompt: String,
    negative_prompt: String,
    steps: u32,
    guidance_scale: f64,
    seed: u64,
    width: u32,
    height: u32,
    sampler: String,
    model: String,
    vae: String,
    lora_path: Option<String>,
    lora_scale: f64,
    upscale: Upscale,
    negative_embedding: Option<String>,
}

impl Default for GeneratorForm {
    fn default() -> Self {
        GeneratorForm {
            prompt: String::new(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            steps: 20,
            guidance_scale: 7.5,
            seed: 0,
            width: 512,
            height: 512,
            sampler: DEFAULT_SAMPLER.to_string(),
            model: String::new(),
            vae: String::new(),
            lora_path: None,
            lora_scale: DEFAULT_LORA_SCALE,
            upscale: Upscale::None,
            negative_embedding: None,
        }
    }
}

impl GeneratorForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    pub fn set_negative_prompt(&mut self, negative_prompt: impl Into<String>) {
        self.negative_prompt = negative_prompt.into();
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn set_steps(&mut self, steps: u32) {
        self.steps = steps.clamp(*STEPS_RANGE.start(), *STEPS_RANGE.end());
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn set_guidance_scale(&mut self, guidance_scale: f64) {
        self.guidance_scale = clamp_f64(guidance_scale, &GUIDANCE_RANGE, self.guidance_scale);
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn set_width(&mut self, width: u32) {
        self.width = snap_dimension(width);
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = snap_dimension(height);
    }

    pub fn sampler(&self) -> &str {
        &self.sampler
    }

    pub fn set_sampler(&mut self, sampler: impl Into<String>) {
        self.sampler = sampler.into();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn vae(&self) -> &str {
        &self.vae
    }

    pub fn set_vae(&mut self, vae: impl Into<String>) {
        self.vae = vae.into();
    }

    pub fn lora_path(&self) -> Option<&str> {
        self.lora_path.as_deref()
    }

    pub fn set_lora(&mut self, lora_path: Option<String>) {
        self.lora_path = non_empty(lora_path);
    }

    pub fn lora_scale(&self) -> f64 {
        self.lora_scale
    }

    pub fn set_lora_scale(&mut self, lora_scale: f64) {
        self.lora_scale = clamp_f64(lora_scale, &LORA_SCALE_RANGE, self.lora_scale);
    }

    pub fn upscale(&self) -> Upscale {
        self.upscale
    }

    pub fn set_upscale(&mut self, upscale: Upscale) {
        self.upscale = upscale;
    }

    pub fn negative_embedding(&self) -> Option<&str> {
        self.negative_embedding.as_deref()
    }

    pub fn set_negative_embedding(&mut self, negative_embedding: Option<String>) {
        self.negative_embedding = non_empty(negative_embedding);
    }

    /// Overwrites the form with a remembered configuration.
    ///
    /// Core parameters are always taken over. Sampler, VAE, LoRA, LoRA scale,
    /// upscale factor and negative embedding are only taken over when the
    /// metadata carries them; otherwise the current values stay.
    pub fn restore_from(&mut self, metadata: &ImageMetadata) {
        self.set_prompt(metadata.prompt.clone());
        self.set_negative_prompt(metadata.negative_prompt.clone());
        self.set_model(metadata.model.clone());
        self.set_seed(metadata.seed);
        self.set_steps(metadata.steps);
        self.set_guidance_scale(metadata.guidance_scale);
        self.set_width(metadata.width);
        self.set_height(metadata.height);

        if let Some(sampler) = &metadata.sampler {
            self.set_sampler(sampler.clone());
        }
        if let Some(vae) = &metadata.vae {
            self.set_vae(vae.clone());
        }
        if let Some(lora_path) = &metadata.lora_path {
            self.set_lora(Some(lora_path.clone()));
        }
        if let Some(lora_scale) = metadata.lora_scale {
            self.set_lora_scale(lora_scale);
        }
        if let Some(upscale) = metadata.upscale_factor {
            self.set_upscale(upscale);
        }
        if let Some(negative_embedding) = &metadata.negative_embedding {
            self.set_negative_embedding(Some(negative_embedding.clone()));
        }
        debug!("Restored form from metadata with seed {}", metadata.seed);
    }

    /// Builds a fresh request, resolving a zero seed through `seeds`.
    pub fn build_request<S: SeedSource + ?Sized>(
        &self,
        seeds: &S,
    ) -> Result<GenerationRequest, GenerateError> {
        if !self.has_prompt() {
            return Err(GenerateError::EmptyPrompt);
        }
        Ok(GenerationRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: resolve_seed(self.seed, seeds),
            width: self.width,
            height: self.height,
            sampler: self.sampler.clone(),
            model: self.model.clone(),
            vae: self.vae.clone(),
            lora_path: self.lora_path.clone(),
            lora_scale: self.lora_scale,
            upscale_factor: self.upscale,
            negative_embedding: self.negative_embedding.clone(),
        })
    }
}

/// At most one generation per invoker; the flag clears when the guard drops,
/// including when the submitting future is abandoned.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

pub struct InFlightGuard<'a>(&'a AtomicBool);

impl InFlight {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(&self.0))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub image_url: String,
    pub request: GenerationRequest,
}

type ImageCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Generator<C, S = RandomSeed> {
    client: C,
    seeds: S,
    in_flight: InFlight,
    on_image_generated: Option<ImageCallback>,
}

impl<C: GenerationApi> Generator<C, RandomSeed> {
    pub fn new(client: C) -> Self {
        Self::with_seeds(client, RandomSeed)
    }
}

impl<C: GenerationApi, S: SeedSource> Generator<C, S> {
    pub fn with_seeds(client: C, seeds: S) -> Self {
        Generator {
            client,
            seeds,
            in_flight: InFlight::default(),
            on_image_generated: None,
        }
    }

    /// Called with the image url after every successful generation.
    pub fn on_image_generated(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_image_generated = Some(Arc::new(callback));
        self
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_active()
    }

    pub fn can_submit(&self, form: &GeneratorForm) -> bool {
        form.has_prompt() && !self.in_flight()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn submit(&self, form: &GeneratorForm) -> Result<Generated, GenerateError> {
        if !form.has_prompt() {
            return Err(GenerateError::EmptyPrompt);
        }
        let _guard = self.in_flight.try_begin().ok_or(GenerateError::Busy)?;
        let request = form.build_request(&self.seeds)?;
        info!(
            "Generating {}x{} with {} steps, seed {}",
            request.width, request.height, request.steps, request.seed
        );

        let image_url = self
            .client
            .generate(&request)
            .await
            .inspect_err(|e| warn!("Generation failed: {e}"))?;

        if let Some(callback) = &self.on_image_generated {
            callback(&image_url);
        }
        Ok(Generated { image_url, request })
    }
}
