use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_PROFILE_ID: &str = "default-assistant";
pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("temperature must be a finite number, got {0}")]
    InvalidTemperature(f32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.8
}

impl Default for AiProfile {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROFILE_ID.into(),
            name: "Assistant".into(),
            model_name: DEFAULT_MODEL.into(),
            system_instruction: "You are a personal WhatsApp assistant. Reply briefly, confidently and politely, \
                                 in the language the sender used."
                .into(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub model_name: Option<String>,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
}

impl AiProfile {
    // nothing is written when the temperature is rejected
    pub fn apply_patch(&mut self, patch: ProfilePatch) -> Result<(), SettingsError> {
        let temperature = patch.temperature.map(clamp_temperature).transpose()?;
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(model_name) = patch.model_name {
            self.model_name = model_name;
        }
        if let Some(system_instruction) = patch.system_instruction {
            self.system_instruction = system_instruction;
        }
        if let Some(t) = temperature {
            self.temperature = t;
        }
        Ok(())
    }
}

pub fn clamp_temperature(t: f32) -> Result<f32, SettingsError> {
    if !t.is_finite() {
        return Err(SettingsError::InvalidTemperature(t));
    }
    Ok(t.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalDefaults {
    pub default_model: String,
    pub temperature: f32,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self { default_model: DEFAULT_MODEL.into(), temperature: default_temperature() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
}

// profile over global; blank model or non-finite temperature falls back
pub fn resolve_generation_params(global: &GlobalDefaults, profile: &AiProfile) -> GenerationParams {
    let model = Some(profile.model_name.trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| global.default_model.clone());

    let temperature = clamp_temperature(profile.temperature)
        .or_else(|_| clamp_temperature(global.temperature))
        .unwrap_or_else(|_| default_temperature());

    let system_instruction = Some(profile.system_instruction.clone()).filter(|s| !s.trim().is_empty());

    GenerationParams { model, system_instruction, temperature }
}
