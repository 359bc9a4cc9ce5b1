//! Natural-language narration of an entity's state and changes.
//!
//! Generators never fail past their boundary: every problem becomes
//! [`Insight::Absent`].

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use orgwatch_core::{FieldChange, ScorePair, TrackedFields};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRequest {
    pub external_key: String,
    pub name: String,
    pub domain: Option<String>,
    pub fields: TrackedFields,
    pub changes: Vec<FieldChange>,
    pub scores: ScorePair,
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsenceReason {
    Disabled,
    TimedOut,
    Empty,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insight {
    Generated { content: String, model: String },
    Absent(AbsenceReason),
}

impl Insight {
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Generated { content, .. } => Some(content),
            Self::Absent(_) => None,
        }
    }
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, request: &InsightRequest) -> Insight;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledInsights;

#[async_trait]
impl InsightGenerator for DisabledInsights {
    async fn generate(&self, _request: &InsightRequest) -> Insight {
        Insight::Absent(AbsenceReason::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    /// Full URL of an OpenAI-compatible `/chat/completions` endpoint.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
}

impl ChatCompletionsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(10),
            temperature: 0.5,
        }
    }
}

pub struct ChatCompletionsInsights {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a data analyst summarizing tracked companies.";

impl ChatCompletionsInsights {
    pub fn new(config: ChatCompletionsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building insight client")?;
        Ok(Self { client, config })
    }

    async fn complete(&self, prompt: String) -> Result<Option<String>, reqwest::Error> {
        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        });
        let response: ChatResponse = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content))
    }
}

#[async_trait]
impl InsightGenerator for ChatCompletionsInsights {
    async fn generate(&self, request: &InsightRequest) -> Insight {
        match self.complete(render_prompt(request)).await {
            Ok(Some(content)) if !content.trim().is_empty() => Insight::Generated {
                content: content.trim().to_string(),
                model: self.config.model.clone(),
            },
            Ok(_) => Insight::Absent(AbsenceReason::Empty),
            Err(err) if err.is_timeout() => Insight::Absent(AbsenceReason::TimedOut),
            Err(err) => {
                warn!(external_key = %request.external_key, error = %err, "insight request failed");
                Insight::Absent(AbsenceReason::Failed(err.to_string()))
            }
        }
    }
}

pub fn render_prompt(request: &InsightRequest) -> String {
    let fields = &request.fields;
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Company Name: {}", request.name);
    let _ = writeln!(
        prompt,
        "Description: {}",
        fields.description.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(prompt, "Stage: {}", fields.stage.as_deref().unwrap_or("unknown"));
    let _ = writeln!(
        prompt,
        "Location: {}",
        fields.location.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(prompt, "Tags: {}", fields.tags.join(", "));

    prompt.push_str("\nRecent Changes:\n");
    if request.changes.is_empty() {
        prompt.push_str("- none\n");
    }
    for change in &request.changes {
        let _ = writeln!(
            prompt,
            "- {}: {} -> {}",
            change.change_type,
            change.old_value.as_deref().unwrap_or("(none)"),
            change.new_value.as_deref().unwrap_or("(none)")
        );
    }

    let _ = write!(
        prompt,
        "\nScores:\nMomentum: {}\nStability: {}\n",
        request.scores.momentum, request.scores.stability
    );

    match &request.question {
        Some(question) => {
            let _ = write!(
                prompt,
                "\nUser Question:\n{question}\n\nTask:\nAnswer the user's question using ONLY \
                 the provided company data. Be factual and concise. If the data does not \
                 contain the answer, say \"Not enough data available.\"\n"
            );
        }
        None => prompt.push_str(
            "\nTask:\nSummarize this company and what changed, using ONLY the provided data. \
             Be factual and concise.\n",
        ),
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgwatch_core::ChangeType;

    fn request(question: Option<&str>) -> InsightRequest {
        InsightRequest {
            external_key: "acme".into(),
            name: "Acme".into(),
            domain: Some("acme.dev".into()),
            fields: TrackedFields {
                stage: Some("Series A".into()),
                tags: vec!["b2b".into(), "saas".into()],
                ..Default::default()
            },
            changes: vec![FieldChange {
                change_type: ChangeType::StageChange,
                old_value: Some("Seed".into()),
                new_value: Some("Series A".into()),
            }],
            scores: ScorePair {
                momentum: 2,
                stability: 93,
            },
            question: question.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn disabled_generator_reports_absence() {
        let insight = DisabledInsights.generate(&request(None)).await;
        assert_eq!(insight, Insight::Absent(AbsenceReason::Disabled));
        assert_eq!(insight.content(), None);
    }

    #[test]
    fn prompt_lists_changes_and_scores() {
        let prompt = render_prompt(&request(None));
        assert!(prompt.contains("Company Name: Acme"));
        assert!(prompt.contains("- STAGE_CHANGE: Seed -> Series A"));
        assert!(prompt.contains("Momentum: 2"));
        assert!(prompt.contains("Stability: 93"));
        assert!(prompt.contains("Tags: b2b, saas"));
        assert!(!prompt.contains("User Question"));
    }

    #[test]
    fn prompt_carries_the_question_when_asked() {
        let prompt = render_prompt(&request(Some("Is Acme growing?")));
        assert!(prompt.contains("User Question:\nIs Acme growing?"));
        assert!(prompt.contains("Not enough data available."));
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_absence() {
        let mut config = ChatCompletionsConfig::new("test-key");
        config.endpoint = "http://127.0.0.1:9/v1/chat/completions".into();
        config.timeout = Duration::from_millis(500);
        let generator = ChatCompletionsInsights::new(config).expect("client");

        let insight = generator.generate(&request(None)).await;
        assert!(matches!(insight, Insight::Absent(_)));
    }
}
