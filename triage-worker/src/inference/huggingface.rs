//! Hugging Face Inference API adapters.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{Classification, TextClassifier, TextGenerator};
use crate::error::ProviderError;

const GENERATION_MAX_LENGTH: u32 = 150;
const GENERATION_TEMPERATURE: f64 = 0.7;

/// Shared connection settings for one hosted model.
#[derive(Clone)]
struct ModelEndpoint {
    client: Client,
    url: Url,
    token: SecretString,
}

impl ModelEndpoint {
    fn new(
        client: Client,
        base: &Url,
        model: &str,
        token: SecretString,
    ) -> Result<Self, ProviderError> {
        let url = base
            .join(model)
            .map_err(|e| ProviderError::Decode(format!("invalid model URL for {model}: {e}")))?;
        Ok(Self { client, url, token })
    }

    async fn call<T: Serialize + ?Sized>(&self, body: &T) -> Result<Value, ProviderError> {
        let mut request = self.client.post(self.url.clone()).json(body);
        if !self.token.expose_secret().is_empty() {
            request = request.bearer_auth(self.token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    inputs: &'a str,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Serialize)]
struct GenerateParameters {
    max_length: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct Generated {
    generated_text: String,
}

/// Sentiment classification via a hosted text-classification model.
pub struct HuggingFaceClassifier {
    endpoint: ModelEndpoint,
}

impl HuggingFaceClassifier {
    pub fn new(
        client: Client,
        base: &Url,
        model: &str,
        token: SecretString,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: ModelEndpoint::new(client, base, model, token)?,
        })
    }
}

/// Pick the top-scoring label from a classification response.
///
/// The API returns either `[{label, score}, ...]` or, for batched inputs,
/// `[[{label, score}, ...]]`.
fn top_classification(value: Value) -> Result<Classification, ProviderError> {
    let candidates = match value {
        Value::Array(outer) if matches!(outer.first(), Some(Value::Array(_))) => {
            match outer.into_iter().next() {
                Some(Value::Array(inner)) => inner,
                _ => Vec::new(),
            }
        }
        Value::Array(items) => items,
        other => {
            return Err(ProviderError::Decode(format!(
                "unexpected classification response: {other}"
            )))
        }
    };

    candidates
        .into_iter()
        .map(serde_json::from_value::<Classification>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProviderError::Decode(format!("bad classification entry: {e}")))?
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .ok_or_else(|| ProviderError::Decode("empty classification response".to_string()))
}

#[async_trait]
impl TextClassifier for HuggingFaceClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ProviderError> {
        let value = self.endpoint.call(&ClassifyRequest { inputs: text }).await?;
        let result = top_classification(value)?;
        debug!(label = %result.label, confidence = result.confidence, "hf_classified");
        Ok(result)
    }
}

/// Reply generation via a hosted text-generation model.
pub struct HuggingFaceGenerator {
    endpoint: ModelEndpoint,
}

impl HuggingFaceGenerator {
    pub fn new(
        client: Client,
        base: &Url,
        model: &str,
        token: SecretString,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: ModelEndpoint::new(client, base, model, token)?,
        })
    }
}

#[async_trait]
impl TextGenerator for HuggingFaceGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            inputs: prompt,
            parameters: GenerateParameters {
                max_length: GENERATION_MAX_LENGTH,
                temperature: GENERATION_TEMPERATURE,
            },
        };

        let value = self.endpoint.call(&request).await?;
        let generated: Vec<Generated> = serde_json::from_value(value)
            .map_err(|e| ProviderError::Decode(format!("bad generation response: {e}")))?;

        let text = generated
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .ok_or_else(|| ProviderError::Decode("empty generation response".to_string()))?;

        debug!(length = text.len(), "hf_generated");
        Ok(text)
    }
}
