use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{ImagePart, LanguageModel, ModelRequest};
use crate::config::ModelSettings;
use crate::parser::json::parse_lenient;

/// How a prompt is sent: text only, or with a screenshot attached.
#[derive(Debug, Clone, Copy)]
pub enum Mode<'a> {
    Text,
    Vision(&'a ImagePart),
}

/// Retrying front door to the language model. Callers get `Some(value)` or
/// `None`; model failures never propagate as errors.
#[derive(Clone)]
pub struct Gateway {
    model: Arc<dyn LanguageModel>,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl Gateway {
    pub fn new(model: Arc<dyn LanguageModel>, settings: &ModelSettings) -> Self {
        Self {
            model,
            max_attempts: settings.max_attempts.max(1),
            backoff_unit: Duration::from_secs(settings.backoff_unit_secs),
        }
    }

    #[cfg(test)]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Raw text of the first non-empty response within the attempt budget.
    pub async fn complete(&self, prompt: &str, mode: Mode<'_>) -> Option<String> {
        let request = ModelRequest {
            prompt: prompt.to_string(),
            image: match mode {
                Mode::Text => None,
                Mode::Vision(img) => Some(img.clone()),
            },
        };

        for attempt in 1..=self.max_attempts {
            match self.model.generate(&request).await {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(model = self.model.name(), attempt, "Model responded");
                    return Some(text);
                }
                Ok(_) => {
                    warn!(model = self.model.name(), attempt, "Empty model response");
                }
                Err(e) => {
                    let class = e.retry_class();
                    warn!(
                        model = self.model.name(),
                        attempt,
                        max = self.max_attempts,
                        retry_class = ?class,
                        error = %e,
                        "Model call failed"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(class.delay(attempt, self.backoff_unit)).await;
                    }
                }
            }
        }

        warn!(model = self.model.name(), "Model gave no usable answer");
        None
    }

    /// Structured answer. With a `schema_hint` key, a parsed value that lacks
    /// that key is treated as no answer.
    pub async fn classify(
        &self,
        prompt: &str,
        mode: Mode<'_>,
        schema_hint: Option<&str>,
    ) -> Option<Value> {
        let text = self.complete(prompt, mode).await?;
        let value = parse_lenient(&text)?;
        match schema_hint {
            Some(key) if value.get(key).is_none() => {
                warn!(key, "Model JSON missing expected key");
                None
            }
            _ => Some(value),
        }
    }
}
