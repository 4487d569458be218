use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{Brain, build_prompt, normalize_reply};
use crate::config::ApiConfig;
use crate::types::Observation;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// One stateless chat-completions request per question.
pub struct ApiBrain {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl ApiBrain {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let api_key = config
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in environment"))?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    async fn complete(&self, full_prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": full_prompt}],
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(anyhow!("model API error ({status}): {err_msg}"));
        }

        json_resp["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow!("No content in model response: {json_resp}"))
    }
}

#[async_trait]
impl Brain for ApiBrain {
    async fn ask(&mut self, prompt: &str, observation: Option<&Observation>) -> Option<String> {
        let full_prompt = build_prompt(prompt, observation);
        match self.complete(&full_prompt).await {
            Ok(content) => {
                debug!(reply = %content, "model replied");
                Some(normalize_reply(&content, observation.is_some()))
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "model API call failed");
                None
            }
        }
    }

    fn label(&self) -> &'static str {
        "api"
    }
}
