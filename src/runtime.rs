use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly participant in a group chat. \
     Mimic the group tone and slang. \
     Keep replies to {max_reply_sentences} sentences or fewer. \
     Do not mention being an AI or a bot.";

/// Effective reply tuning, after merging operator overrides over the
/// compiled defaults. Read on every processed update.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySettings {
    pub reply_chance: f64,
    pub cooldown_seconds: u64,
    pub context_messages: usize,
    pub history_limit: usize,
    pub max_reply_sentences: usize,
    pub model_temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            reply_chance: 0.15,
            cooldown_seconds: 300,
            context_messages: 10,
            history_limit: 50,
            max_reply_sentences: 2,
            model_temperature: 0.9,
            max_tokens: 200,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ReplySettings {
    /// System prompt with the sentence budget substituted in.
    pub fn rendered_system_prompt(&self) -> String {
        self.system_prompt.replace(
            "{max_reply_sentences}",
            &self.max_reply_sentences.to_string(),
        )
    }
}

/// Rejected admin input. The message is sent back to the operator verbatim.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValueError {
    #[error("{field} expects {expected}")]
    NotNumeric {
        field: &'static str,
        expected: &'static str,
    },
    #[error("{field} must be within [{low}, {high}]")]
    OutOfRange {
        field: &'static str,
        low: f64,
        high: f64,
    },
    #[error("system_prompt must not be empty")]
    EmptyPrompt,
}

/// Operator overrides, one optional slot per tunable. Persisted as a single
/// JSON document; absent fields fall back to the compiled defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_chance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_messages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reply_sentences: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl SettingsOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge these overrides over the compiled defaults.
    pub fn merged(&self) -> ReplySettings {
        let mut settings = ReplySettings::default();
        if let Some(v) = self.reply_chance {
            settings.reply_chance = v;
        }
        if let Some(v) = self.cooldown_seconds {
            settings.cooldown_seconds = v;
        }
        if let Some(v) = self.context_messages {
            settings.context_messages = v;
        }
        if let Some(v) = self.history_limit {
            settings.history_limit = v;
        }
        if let Some(v) = self.max_reply_sentences {
            settings.max_reply_sentences = v;
        }
        if let Some(v) = self.model_temperature {
            settings.model_temperature = v;
        }
        if let Some(v) = self.max_tokens {
            settings.max_tokens = v;
        }
        if let Some(ref v) = self.system_prompt {
            settings.system_prompt = v.clone();
        }
        settings
    }

    pub fn set_reply_chance(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value: f64 = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
            field: "reply_chance",
            expected: "a number",
        })?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigValueError::OutOfRange {
                field: "reply_chance",
                low: 0.0,
                high: 1.0,
            });
        }
        self.reply_chance = Some(value);
        Ok(())
    }

    pub fn set_cooldown_seconds(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value: u64 = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
            field: "cooldown_seconds",
            expected: "a non-negative integer",
        })?;
        self.cooldown_seconds = Some(value);
        Ok(())
    }

    pub fn set_context_messages(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        self.context_messages = Some(parse_positive(raw, "context_messages")?);
        Ok(())
    }

    pub fn set_history_limit(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        self.history_limit = Some(parse_positive(raw, "history_limit")?);
        Ok(())
    }

    pub fn set_max_reply_sentences(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value: usize = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
            field: "max_reply_sentences",
            expected: "a non-negative integer",
        })?;
        self.max_reply_sentences = Some(value);
        Ok(())
    }

    pub fn set_model_temperature(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value: f64 = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
            field: "model_temperature",
            expected: "a number",
        })?;
        if !(0.0..=2.0).contains(&value) {
            return Err(ConfigValueError::OutOfRange {
                field: "model_temperature",
                low: 0.0,
                high: 2.0,
            });
        }
        self.model_temperature = Some(value);
        Ok(())
    }

    pub fn set_max_tokens(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value: u32 = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
            field: "max_tokens",
            expected: "a positive integer",
        })?;
        if value == 0 {
            return Err(ConfigValueError::NotNumeric {
                field: "max_tokens",
                expected: "a positive integer",
            });
        }
        self.max_tokens = Some(value);
        Ok(())
    }

    pub fn set_system_prompt(&mut self, raw: &str) -> Result<(), ConfigValueError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(ConfigValueError::EmptyPrompt);
        }
        self.system_prompt = Some(value.to_string());
        Ok(())
    }
}

fn parse_positive(raw: &str, field: &'static str) -> Result<usize, ConfigValueError> {
    let value: usize = raw.trim().parse().map_err(|_| ConfigValueError::NotNumeric {
        field,
        expected: "a positive integer",
    })?;
    if value == 0 {
        return Err(ConfigValueError::NotNumeric {
            field,
            expected: "a positive integer",
        });
    }
    Ok(value)
}
