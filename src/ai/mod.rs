pub mod gateway;
pub mod gemini;
pub mod prompts;

use async_trait::async_trait;

use crate::error::ModelError;

pub use gateway::{Gateway, Mode};
pub use gemini::Gemini;

/// Image attached to a vision prompt.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePart {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub image: Option<ImagePart>,
}

/// A generative model that turns a prompt into free text. Nothing about the
/// shape of the text is guaranteed.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError>;
    fn name(&self) -> &str;
}
