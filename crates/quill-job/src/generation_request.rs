use serde::{Deserialize, Serialize};

use crate::job_state::JobError;

pub const DESCRIPTION_MIN_CHARS: usize = 10;
pub const DESCRIPTION_MAX_CHARS: usize = 2_000;
pub const TEMPERATURE_MIN: f32 = 0.0;
pub const TEMPERATURE_MAX: f32 = 2.0;
pub const TARGET_LENGTH_MIN_WORDS: u32 = 100;
pub const TARGET_LENGTH_MAX_WORDS: u32 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ScriptType` values.
pub enum ScriptType {
    Screenplay,
    Teleplay,
    StagePlay,
    AudioDrama,
}

impl ScriptType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screenplay => "screenplay",
            Self::Teleplay => "teleplay",
            Self::StagePlay => "stage_play",
            Self::AudioDrama => "audio_drama",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `GenerationRequest` used across Quill components.
///
/// Everything the job-control API needs to start one generation. Validated
/// locally before any network activity; an invalid request never opens a
/// connection.
pub struct GenerationRequest {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<u32>,
    pub description: String,
    pub script_type: ScriptType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f32,
    pub target_length_words: u32,
}

impl GenerationRequest {
    /// Fails fast on the first problem with a local, non-retryable error.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.project_id.trim().is_empty() {
            return Err(JobError::Validation("project id must not be empty".to_string()));
        }
        if let Some(episode_number) = self.episode_number {
            if episode_number == 0 {
                return Err(JobError::Validation(
                    "episode number must be 1 or greater".to_string(),
                ));
            }
        }
        let description_chars = self.description.trim().chars().count();
        if description_chars < DESCRIPTION_MIN_CHARS {
            return Err(JobError::Validation(format!(
                "description must be at least {DESCRIPTION_MIN_CHARS} characters, got {description_chars}"
            )));
        }
        if description_chars > DESCRIPTION_MAX_CHARS {
            return Err(JobError::Validation(format!(
                "description must be at most {DESCRIPTION_MAX_CHARS} characters, got {description_chars}"
            )));
        }
        if !self.temperature.is_finite()
            || self.temperature < TEMPERATURE_MIN
            || self.temperature > TEMPERATURE_MAX
        {
            return Err(JobError::Validation(format!(
                "temperature must be between {TEMPERATURE_MIN} and {TEMPERATURE_MAX}, got {}",
                self.temperature
            )));
        }
        if self.target_length_words < TARGET_LENGTH_MIN_WORDS
            || self.target_length_words > TARGET_LENGTH_MAX_WORDS
        {
            return Err(JobError::Validation(format!(
                "target length must be between {TARGET_LENGTH_MIN_WORDS} and {TARGET_LENGTH_MAX_WORDS} words, got {}",
                self.target_length_words
            )));
        }
        Ok(())
    }
}
