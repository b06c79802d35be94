//! Gemini API client
//!
//! Used as the external intent oracle for questions the cue table cannot
//! decide. Uses a long-lived reqwest::Client for connection pooling.

use crate::classifier::{Intent, IntentOracle};
use crate::error::AnalyticsError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const CLASSIFICATION_PROMPT: &str = r#"You are a query classifier for the financial analytics of an agricultural producer.

Classify the question into EXACTLY ONE category:
- DESCRIPTIVE: asks for facts, values, summaries ("What is revenue for 2025?")
- DIAGNOSTIC: asks why something happened, variances, comparisons ("Why did net income beat budget?")
- PREDICTIVE: asks about future outcomes, scenarios, sensitivities ("What if wheat prices drop 15%?")
- PRESCRIPTIVE: asks for recommendations or actions ("Where can we reduce costs?")

Respond with ONLY one word: DESCRIPTIVE, DIAGNOSTIC, PREDICTIVE, or PRESCRIPTIVE."#;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(20))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        })
    }

    /// Generate a response under the given system instruction.
    pub async fn generate(
        &self,
        system_prompt: &str,
        query: &str,
        max_output_tokens: i32,
    ) -> crate::Result<(String, f32)> {

        if self.api_key.is_empty() {
            return Err(AnalyticsError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: query.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AnalyticsError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AnalyticsError::LlmError(
                format!("Gemini API error: {}", error_text)
            ));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AnalyticsError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        if gemini_response.candidates.is_empty() {
            return Err(AnalyticsError::LlmError(
                "No response from Gemini API".to_string(),
            ));
        }

        let answer = gemini_response.candidates[0]
            .content
            .parts
            .first()
            .ok_or_else(|| {
                AnalyticsError::LlmError("Empty response from Gemini".to_string())
            })?
            .text
            .clone();

        let confidence = calculate_confidence(&gemini_response);

        info!("Gemini response received (confidence: {})", confidence);

        Ok((answer, confidence))
    }
}

/// Intent oracle backed by Gemini.
pub struct GeminiIntentOracle {
    client: GeminiClient,
}

impl GeminiIntentOracle {
    pub fn new(api_key: String) -> crate::Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key)?,
        })
    }
}

#[async_trait::async_trait]
impl IntentOracle for GeminiIntentOracle {
    async fn classify_free_text(&self, question: &str) -> crate::Result<String> {
        let (answer, _) = self
            .client
            .generate(CLASSIFICATION_PROMPT, question, 8)
            .await?;
        Ok(first_label(&answer))
    }
}

/// First line of the answer; models sometimes append an explanation.
fn first_label(answer: &str) -> String {
    answer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    #[serde(alias = "finishReason")]
    finish_reason: Option<String>,
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f32 {
    let base_confidence: f32 = 0.85;

    let finish_confidence = match response.candidates[0].finish_reason.as_deref() {
        Some("STOP") => 1.0,
        Some("MAX_TOKENS") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    base_confidence * finish_confidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "Why did net income beat budget?".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: CLASSIFICATION_PROMPT.to_string(),
                }],
            },
        };

        let json = serde_json::to_string(&request);
        assert!(json.is_ok());
        assert!(json.unwrap().contains("beat budget"));
    }

    #[test]
    fn test_first_label_is_validated_downstream() {
        let label = first_label("\n  Diagnostic\nBecause the question asks why.");
        assert_eq!(label, "Diagnostic");
        assert_eq!(Intent::from_label(&label).unwrap(), Intent::Diagnostic);
        assert_eq!(first_label(""), "");
    }

    #[test]
    fn test_response_confidence() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"PREDICTIVE"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(calculate_confidence(&response), 0.85);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_llm_error() {
        let oracle = GeminiIntentOracle::new(String::new()).unwrap();
        let err = oracle.classify_free_text("Margins are down").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::LlmError(_)));
    }
}
