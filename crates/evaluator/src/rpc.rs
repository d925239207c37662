//! Client for the remote inference service: submit an analysis task, then
//! poll its status until terminal.

use anyhow::Context;
use models::WireConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct AnalyzeRequest {
    /// Cross-store traceability id, `batch_{batch_id}_doc_{document_id}`.
    pub doc_id: String,
    pub content_b64: String,
    pub prompts: Vec<PromptEntry>,
    pub llm_provider: WireConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct PromptEntry {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeAccepted {
    pub task_id: String,
    #[allow(dead_code)]
    pub status: Option<String>,
}

/// Remote task status payload. `scoring_result` may be absent entirely;
/// absent means the stored score stays null.
#[derive(Debug, Deserialize)]
pub struct TaskStatus {
    pub status: RemoteState,
    #[serde(default)]
    pub results: Vec<PromptResult>,
    pub scoring_result: Option<ScoringResult>,
    pub error: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct PromptResult {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<i32>,
    #[serde(default)]
    pub output_tokens: Option<i32>,
    #[serde(default)]
    pub time_taken_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ScoringResult {
    pub overall_score: Option<f64>,
    #[allow(dead_code)]
    pub confidence: Option<f64>,
    #[allow(dead_code)]
    #[serde(default)]
    pub subscores: Option<serde_json::Value>,
}

impl TaskStatus {
    /// Aggregate metrics across prompt results: tokens and elapsed time are
    /// summed, while the single top-level scoring result provides the score.
    pub fn aggregate(&self) -> AggregatedResult {
        let mut input_tokens: Option<i32> = None;
        let mut output_tokens: Option<i32> = None;
        let mut time_taken: Option<f64> = None;
        let mut text = String::new();

        for result in &self.results {
            if let Some(t) = result.input_tokens {
                *input_tokens.get_or_insert(0) += t;
            }
            if let Some(t) = result.output_tokens {
                *output_tokens.get_or_insert(0) += t;
            }
            if let Some(s) = result.time_taken_seconds {
                *time_taken.get_or_insert(0.0) += s;
            }
            if let Some(response) = &result.response {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(response);
            }
        }

        let tokens_per_second = match (output_tokens, time_taken) {
            (Some(tokens), Some(secs)) if secs > 0.0 => Some(f64::from(tokens) / secs),
            _ => None,
        };

        AggregatedResult {
            response_text: text,
            input_tokens,
            output_tokens,
            time_taken_seconds: time_taken,
            tokens_per_second,
            overall_score: self
                .scoring_result
                .as_ref()
                .and_then(|scoring| scoring.overall_score),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct AggregatedResult {
    pub response_text: String,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub time_taken_seconds: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub overall_score: Option<f64>,
}

/// Thin reqwest wrapper around the inference service endpoints.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: url::Url,
}

impl Client {
    pub fn new(base_url: url::Url, request_timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .context("building inference HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    /// Submit an analysis. The remote accepts synchronously and returns a
    /// task handle for polling.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> anyhow::Result<AnalyzeAccepted> {
        let url = self.base_url.join("analyze")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .context("dispatching analyze request")?;
        let response = response
            .error_for_status()
            .context("analyze request rejected")?;
        Ok(response
            .json::<AnalyzeAccepted>()
            .await
            .context("decoding analyze acceptance")?)
    }

    pub async fn task_status(&self, task_id: &str) -> anyhow::Result<TaskStatus> {
        let url = self.base_url.join(&format!("analyze_status/{task_id}"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("polling task status")?
            .error_for_status()
            .context("status poll rejected")?;
        Ok(response
            .json::<TaskStatus>()
            .await
            .context("decoding task status")?)
    }

    /// Cheap reachability probe used by health checks and connection tests.
    pub async fn probe(&self, base_url: &str) -> bool {
        match self.http.head(base_url).send().await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(base_url, ?err, "reachability probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn score_extraction_from_structured_payload() {
        let status: TaskStatus = serde_json::from_value(serde_json::json!({
            "status": "COMPLETED",
            "results": [
                {"response": "first", "input_tokens": 100, "output_tokens": 40, "time_taken_seconds": 2.0},
                {"response": "second", "input_tokens": 50, "output_tokens": 10, "time_taken_seconds": 3.0},
            ],
            "scoring_result": {"overall_score": 87.5, "confidence": 91.0, "subscores": {"clarity": 80}},
        }))
        .unwrap();

        let aggregated = status.aggregate();
        assert_eq!(aggregated.input_tokens, Some(150));
        assert_eq!(aggregated.output_tokens, Some(50));
        assert_eq!(aggregated.time_taken_seconds, Some(5.0));
        assert_eq!(aggregated.tokens_per_second, Some(10.0));
        assert_eq!(aggregated.overall_score, Some(87.5));
        assert_eq!(aggregated.response_text, "first\n\nsecond");
    }

    #[test]
    fn absent_scoring_result_yields_null_score() {
        let status: TaskStatus = serde_json::from_value(serde_json::json!({
            "status": "COMPLETED",
            "results": [{"response": "ok"}],
        }))
        .unwrap();
        assert_eq!(status.aggregate().overall_score, None);
    }

    #[test]
    fn zero_elapsed_time_yields_null_throughput() {
        let status: TaskStatus = serde_json::from_value(serde_json::json!({
            "status": "COMPLETED",
            "results": [{"response": "ok", "output_tokens": 10, "time_taken_seconds": 0.0}],
        }))
        .unwrap();
        let aggregated = status.aggregate();
        assert_eq!(aggregated.output_tokens, Some(10));
        assert_eq!(aggregated.tokens_per_second, None);
    }

    #[test]
    fn analyze_request_wire_shape() {
        let request = AnalyzeRequest {
            doc_id: "batch_7_doc_42".to_string(),
            content_b64: "QUJD".to_string(),
            prompts: vec![PromptEntry {
                prompt: "score this document".to_string(),
            }],
            llm_provider: WireConfig {
                provider_type: "ollama".to_string(),
                base_url: "http://studio.local:11434".to_string(),
                model_name: "gemma3".to_string(),
                api_key: None,
            },
            meta_data: None,
        };
        // The exact outbound body: absent fields are omitted, not null.
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "doc_id": "batch_7_doc_42",
                "content_b64": "QUJD",
                "prompts": [{"prompt": "score this document"}],
                "llm_provider": {
                    "provider_type": "ollama",
                    "base_url": "http://studio.local:11434",
                    "model_name": "gemma3",
                },
            })
        );
    }

    #[test]
    fn remote_states_parse() {
        for (raw, expect) in [
            ("PROCESSING", RemoteState::Processing),
            ("COMPLETED", RemoteState::Completed),
            ("FAILED", RemoteState::Failed),
        ] {
            let status: TaskStatus =
                serde_json::from_value(serde_json::json!({"status": raw})).unwrap();
            assert_eq!(status.status, expect);
        }
    }
}
