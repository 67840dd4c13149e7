use crate::error::{PipelineError, Result, Stage};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// How [`DeadLetter::body`] holds the original message bytes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Envelope published to the dead-letter queue for a message that will not
/// be retried.
///
/// UTF-8 bodies are kept as text so they can be read in place; anything
/// else is base64 encoded. [`DeadLetter::original_body`] gives back the
/// exact bytes for replay.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub source_queue: String,
    pub stage: String,
    pub reason: String,
    pub delivery_count: u32,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    pub body: String,
}

impl DeadLetter {
    pub fn new(
        source_queue: &str,
        stage: Stage,
        error: &PipelineError,
        delivery_count: u32,
        body: &[u8],
    ) -> Self {
        let (body_encoding, body) = match std::str::from_utf8(body) {
            Ok(text) => (BodyEncoding::Utf8, text.to_string()),
            Err(_) => (BodyEncoding::Base64, STANDARD.encode(body)),
        };
        Self {
            source_queue: source_queue.to_string(),
            stage: stage.to_string(),
            reason: error.to_string(),
            delivery_count,
            body_encoding,
            body,
        }
    }

    pub fn original_body(&self) -> Result<Vec<u8>> {
        match self.body_encoding {
            BodyEncoding::Utf8 => Ok(self.body.clone().into_bytes()),
            BodyEncoding::Base64 => STANDARD
                .decode(&self.body)
                .map_err(|e| PipelineError::Decode(format!("dead-letter body: {e}"))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
