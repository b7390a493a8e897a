use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;
use std::fmt;

/// Post-processing multiplier; travels as the plain integers 0, 2 or 4.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Upscale {
    #[default]
    None,
    X2,
    X4,
}

impl From<Upscale> for u8 {
    fn from(value: Upscale) -> Self {
        match value {
            Upscale::None => 0,
            Upscale::X2 => 2,
            Upscale::X4 => 4,
        }
    }
}

impl TryFrom<u8> for Upscale {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Upscale::None),
            2 => Ok(Upscale::X2),
            4 => Ok(Upscale::X4),
            other => Err(format!("unsupported upscale factor {other}")),
        }
    }
}

impl fmt::Display for Upscale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upscale::None => write!(f, "off"),
            other => write!(f, "x{}", u8::from(*other)),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance_scale: f64,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub sampler: String,
    pub model: String,
    pub vae: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_path: Option<String>,
    pub lora_scale: f64,
    pub upscale_factor: Upscale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_embedding: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: Option<bool>,
    pub image_url: Option<String>,
    pub error: Option<String>,
    pub parameters: Option<Value>,
}

/// Parameters the backend recorded for a generated image.
///
/// Optional fields stay `None` when the backend did not report them, so a
/// restore never clobbers form defaults with missing values.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub model: String,
    pub seed: u64,
    pub steps: u32,
    pub guidance_scale: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<String>,
    #[serde(default, alias = "lora", skip_serializing_if = "Option::is_none")]
    pub lora_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale_factor: Option<Upscale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_embedding: Option<String>,
}

impl From<&GenerationRequest> for ImageMetadata {
    fn from(request: &GenerationRequest) -> Self {
        ImageMetadata {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            model: request.model.clone(),
            seed: request.seed,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            width: request.width,
            height: request.height,
            sampler: Some(request.sampler.clone()),
            vae: Some(request.vae.clone()).filter(|v| !v.is_empty()),
            lora_path: request.lora_path.clone(),
            lora_scale: request.lora_path.as_ref().map(|_| request.lora_scale),
            upscale_factor: Some(request.upscale_factor),
            negative_embedding: request.negative_embedding.clone(),
        }
    }
}
