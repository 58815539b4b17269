//! Admin configuration of the recommendation backend.

use crate::error::{self, ApiError, ApiResult};
use crate::session::Credential;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// LLM provider the backend uses to generate explanations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmBackendKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "huggingface")]
    HuggingFace,
}

impl LlmBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmBackendKind::OpenAi => "openai",
            LlmBackendKind::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for LlmBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmBackendKind::OpenAi),
            "huggingface" | "hf" => Ok(LlmBackendKind::HuggingFace),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LlmConfig {
    pub llm_backend: LlmBackendKind,
    #[serde(default)]
    pub has_openai_key: bool,
    #[serde(default)]
    pub has_hf_key: bool,
}

/// Answer from the `/chat` connectivity probe.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LlmProbe {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
}

#[derive(Serialize)]
struct LlmConfigUpdate<'a> {
    llm_backend: LlmBackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct ProbeRequest<'a> {
    symptoms: &'a str,
}

pub struct AdminClient {
    client: reqwest::Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_llm_config(&self, credential: &Credential) -> ApiResult<LlmConfig> {
        let response = self
            .client
            .get(self.url("/admin/config/llm"))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        error::read_json(response).await
    }

    /// Switches the LLM provider. The key is only sent for OpenAI; an empty
    /// key keeps the one the server already has.
    pub async fn set_llm_backend(
        &self,
        credential: &Credential,
        kind: LlmBackendKind,
        api_key: Option<&str>,
    ) -> ApiResult<String> {
        let api_key = match kind {
            LlmBackendKind::OpenAi => api_key.map(str::trim).filter(|k| !k.is_empty()),
            LlmBackendKind::HuggingFace => None,
        };
        let response = self
            .client
            .put(self.url("/admin/config/llm"))
            .bearer_auth(credential.expose())
            .json(&LlmConfigUpdate {
                llm_backend: kind,
                api_key,
            })
            .send()
            .await?;
        let status: StatusResponse = error::read_json(response).await?;
        if status.status != "success" {
            return Err(ApiError::Rejected(status.message));
        }
        tracing::info!(backend = %kind, key_sent = api_key.is_some(), "LLM backend updated");
        Ok(status.message)
    }

    pub async fn rebuild_index(&self, credential: &Credential) -> ApiResult<()> {
        let response = self
            .client
            .post(self.url("/admin/rebuild-index"))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        error::read_body(response).await?;
        tracing::info!("search index rebuild requested");
        Ok(())
    }

    /// Sends a short question through `/chat` to check the LLM answers.
    pub async fn test_llm(&self, question: &str) -> ApiResult<LlmProbe> {
        let response = self
            .client
            .post(self.url("/chat"))
            .json(&ProbeRequest { symptoms: question })
            .send()
            .await?;
        error::read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_body_omits_key_when_absent() {
        let body = serde_json::to_value(LlmConfigUpdate {
            llm_backend: LlmBackendKind::HuggingFace,
            api_key: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"llm_backend": "huggingface"}));
    }

    #[test]
    fn test_config_parsing() {
        let config: LlmConfig = serde_json::from_str(
            r#"{"llm_backend": "openai", "has_openai_key": true, "has_hf_key": false}"#,
        )
        .unwrap();
        assert_eq!(config.llm_backend, LlmBackendKind::OpenAi);
        assert!(config.has_openai_key);
        assert_eq!("hf".parse(), Ok(LlmBackendKind::HuggingFace));
    }
}
