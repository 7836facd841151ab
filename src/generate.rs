//! Answer generation with tiered provider fallback.
//!
//! [`GenerationProvider`] is the chat-completion seam, implemented by
//! [`GeminiGenerator`] and [`OpenAiGenerator`]. The [`Orchestrator`] owns
//! the input gate, prompt construction and the primary → secondary →
//! degraded progression:
//!
//! ```text
//! VALIDATING ──(too long)──▶ REJECTED
//!     │
//!     ▼
//! GENERATING(primary) ──(fail)──▶ GENERATING(secondary) ──(fail)──▶ DEGRADED
//!     │                               │
//!     ▼                               ▼
//!   DONE                            DONE
//! ```
//!
//! A degraded answer is still a well-formed answer: it carries a fixed
//! apologetic message and the citations that were assembled for it.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, ProviderConfig};
use crate::error::{Capability, ProviderError, RagError};
use crate::models::{Citation, ConversationTurn, Role, ServedBy};
use crate::usage::{estimate_tokens, UsageCounters, CHARS_PER_TOKEN};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Returned when every generation tier failed.
pub const DEGRADED_ANSWER: &str =
    "I'm sorry, I can't answer that right now. Please try again later or contact HR.";

/// A chat message sent to a generation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Model => MessageRole::Assistant,
        }
    }
}

/// Completion text plus the tokens the call consumed.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
}

/// Trait for chat-completion backends.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    /// Send a chat completion request and return the response text.
    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError>;
}

/// Fallback token estimate when a provider reports no usage.
fn estimate_call_tokens(messages: &[Message], text: &str) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum::<u64>() + estimate_tokens(text)
}

// ============ Gemini ============

pub struct GeminiGenerator {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(client: reqwest::Client, model: String, api_key: String, base_url: String) -> Self {
        Self {
            client,
            model,
            api_key,
            base_url,
        }
    }

    /// Build the request body for the `generateContent` API.
    fn build_request_body(messages: &[Message], temperature: f32, max_tokens: u32) -> serde_json::Value {
        // Gemini takes system text in a separate field
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|m| {
                let role = match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                    MessageRole::System => return None,
                };
                Some(json!({ "role": role, "parts": [{ "text": m.content }] }))
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
            },
        });

        if !system.is_empty() {
            body["system_instruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }

        body
    }
}

#[async_trait]
impl GenerationProvider for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        debug!("Gemini request to model={}", self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_request_body(messages, temperature, max_tokens))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let resp: serde_json::Value = response.json().await?;
        parse_gemini_completion(&resp, messages)
    }
}

fn parse_gemini_completion(
    resp: &serde_json::Value,
    messages: &[Message],
) -> Result<Completion, ProviderError> {
    let parts = resp["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("missing candidates[0].content.parts".into()))?;
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidResponse("empty completion".into()));
    }
    let tokens = resp["usageMetadata"]["totalTokenCount"]
        .as_u64()
        .unwrap_or_else(|| estimate_call_tokens(messages, &text));
    Ok(Completion { text, tokens })
}

// ============ OpenAI ============

pub struct OpenAiGenerator {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiGenerator {
    pub fn new(client: reqwest::Client, model: String, api_key: String, base_url: String) -> Self {
        Self {
            client,
            model,
            api_key,
            base_url,
        }
    }

    fn build_request_body(
        model: &str,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        json!({
            "model": model,
            "messages": api_messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!("OpenAI request to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::build_request_body(&self.model, messages, temperature, max_tokens))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let resp: serde_json::Value = response.json().await?;
        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
            .to_string();
        let tokens = resp["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or_else(|| estimate_call_tokens(messages, &text));
        Ok(Completion { text, tokens })
    }
}

/// Create the [`GenerationProvider`] for one configured tier.
pub fn create_generator(
    config: &ProviderConfig,
    timeout_secs: u64,
) -> anyhow::Result<Arc<dyn GenerationProvider>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("API key missing for {} generation", config.provider))?;
    let base_url = |default: &str| {
        config
            .base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    };

    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiGenerator::new(
            client,
            config.model.clone(),
            api_key,
            base_url(GEMINI_BASE_URL),
        ))),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(
            client,
            config.model.clone(),
            api_key,
            base_url(OPENAI_BASE_URL),
        ))),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

/// A generated (or degraded) answer.
#[derive(Debug, Clone)]
pub struct Generation {
    pub answer: String,
    pub provider: ServedBy,
    pub sources: Vec<Citation>,
}

/// Input gate, prompt builder and tier driver for answer generation.
pub struct Orchestrator {
    tiers: Vec<Arc<dyn GenerationProvider>>,
    system_prompt: String,
    max_input_chars: usize,
    max_output_tokens: u32,
    temperature: f32,
    usage: Arc<UsageCounters>,
}

impl Orchestrator {
    pub fn new(
        tiers: Vec<Arc<dyn GenerationProvider>>,
        system_prompt: String,
        max_input_chars: usize,
        max_output_tokens: u32,
        temperature: f32,
        usage: Arc<UsageCounters>,
    ) -> Self {
        Self {
            tiers,
            system_prompt,
            max_input_chars,
            max_output_tokens,
            temperature,
            usage,
        }
    }

    /// Build the configured tiers and read the system prompt file once.
    pub fn from_config(config: &Config, usage: Arc<UsageCounters>) -> anyhow::Result<Self> {
        let generation = &config.generation;
        let system_prompt = std::fs::read_to_string(&generation.system_prompt_path)
            .with_context(|| {
                format!(
                    "Failed to read system prompt: {}",
                    generation.system_prompt_path.display()
                )
            })?;

        let mut tiers = vec![create_generator(&generation.primary, generation.timeout_secs)?];
        if let Some(secondary) = &generation.secondary {
            tiers.push(create_generator(secondary, generation.timeout_secs)?);
        }

        Ok(Self::new(
            tiers,
            system_prompt.trim().to_string(),
            generation.max_input_chars,
            generation.max_output_tokens,
            generation.temperature,
            usage,
        ))
    }

    /// Reject questions longer than the configured character limit.
    pub fn validate(&self, question: &str) -> Result<(), RagError> {
        let len = question.chars().count();
        if len > self.max_input_chars {
            return Err(RagError::InputRejected {
                len,
                max: self.max_input_chars,
            });
        }
        Ok(())
    }

    /// System instructions and context, then history, then the question.
    pub fn build_messages(
        &self,
        question: &str,
        history: &[ConversationTurn],
        context: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message {
            role: MessageRole::System,
            content: format!("{}\n\n### Source data:\n{}", self.system_prompt, context),
        });
        messages.extend(history.iter().map(|turn| Message {
            role: turn.role.into(),
            content: turn.content.clone(),
        }));
        messages.push(Message {
            role: MessageRole::User,
            content: question.to_string(),
        });
        messages
    }

    /// Generate an answer, falling back through the tiers and degrading
    /// when all of them fail. Only an over-long question is an error.
    pub async fn generate(
        &self,
        question: &str,
        history: &[ConversationTurn],
        context: &str,
        citations: Vec<Citation>,
    ) -> Result<Generation, RagError> {
        self.validate(question)?;
        let messages = self.build_messages(question, history, context);

        for (position, provider) in self.tiers.iter().enumerate() {
            match provider
                .complete(&messages, self.temperature, self.max_output_tokens)
                .await
            {
                Ok(completion) => {
                    self.usage
                        .record_success(Capability::Generation, position, completion.tokens);
                    if position > 0 {
                        self.usage.record_fallback(Capability::Generation);
                    }
                    debug!("answer generated by {} ({})", provider.name(), provider.model_name());
                    return Ok(Generation {
                        answer: self.cap_answer(completion.text.trim()),
                        provider: ServedBy::tier(position),
                        sources: citations,
                    });
                }
                Err(e) => {
                    self.usage.record_failure(Capability::Generation, position);
                    warn!(
                        "generation provider {} ({}) {}: {}",
                        provider.name(),
                        provider.model_name(),
                        if e.is_quota() { "is out of quota" } else { "failed" },
                        e
                    );
                }
            }
        }

        Ok(self.degraded(citations))
    }

    /// The fixed fallback answer, counted as degraded.
    pub fn degraded(&self, citations: Vec<Citation>) -> Generation {
        self.usage.record_degraded();
        Generation {
            answer: DEGRADED_ANSWER.to_string(),
            provider: ServedBy::Degraded,
            sources: citations,
        }
    }

    fn cap_answer(&self, text: &str) -> String {
        let limit = self.max_output_tokens as usize * CHARS_PER_TOKEN;
        match text.char_indices().nth(limit) {
            Some((byte, _)) => text[..byte].to_string(),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns a canned reply or fails, and records what it was sent.
    struct ScriptedGenerator {
        reply: Option<&'static str>,
        calls: AtomicUsize,
        last_messages: Mutex<Vec<Message>>,
    }

    impl ScriptedGenerator {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model_name(&self) -> &str {
            "scripted-1"
        }
        async fn complete(
            &self,
            messages: &[Message],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            match self.reply {
                Some(text) => Ok(Completion {
                    text: text.to_string(),
                    tokens: 10,
                }),
                None => Err(ProviderError::QuotaExceeded {
                    status: 429,
                    body: "RESOURCE_EXHAUSTED".into(),
                }),
            }
        }
    }

    fn orchestrator(
        primary: Arc<ScriptedGenerator>,
        secondary: Arc<ScriptedGenerator>,
        usage: Arc<UsageCounters>,
    ) -> Orchestrator {
        let tiers: Vec<Arc<dyn GenerationProvider>> = vec![primary, secondary];
        Orchestrator::new(tiers, "Answer from the sources.".into(), 200, 400, 0.2, usage)
    }

    fn citations() -> Vec<Citation> {
        vec![Citation {
            source: "vacation.md".into(),
            url: None,
        }]
    }

    #[tokio::test]
    async fn test_primary_answers() {
        let usage = Arc::new(UsageCounters::new());
        let primary = ScriptedGenerator::new(Some("  15 days.  "));
        let secondary = ScriptedGenerator::new(Some("unused"));
        let orch = orchestrator(primary.clone(), secondary.clone(), usage.clone());

        let gen = orch.generate("How many days?", &[], "ctx", citations()).await.unwrap();
        assert_eq!(gen.answer, "15 days.");
        assert_eq!(gen.provider, ServedBy::Primary);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);

        let snap = usage.snapshot();
        assert_eq!(snap.generation.primary.requests, 1);
        assert_eq!(snap.generation.primary.tokens, 10);
        assert_eq!(snap.generation.fallbacks, 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_secondary() {
        let usage = Arc::new(UsageCounters::new());
        let primary = ScriptedGenerator::new(None);
        let secondary = ScriptedGenerator::new(Some("From the backup."));
        let orch = orchestrator(primary.clone(), secondary.clone(), usage.clone());

        let gen = orch.generate("q", &[], "ctx", citations()).await.unwrap();
        assert_eq!(gen.provider, ServedBy::Secondary);
        assert_eq!(gen.answer, "From the backup.");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);

        let snap = usage.snapshot();
        assert_eq!(snap.generation.primary.failures, 1);
        assert_eq!(snap.generation.secondary.requests, 1);
        assert_eq!(snap.generation.fallbacks, 1);
    }

    #[tokio::test]
    async fn test_all_tiers_failing_degrades_with_sources() {
        let usage = Arc::new(UsageCounters::new());
        let orch = orchestrator(
            ScriptedGenerator::new(None),
            ScriptedGenerator::new(None),
            usage.clone(),
        );

        let gen = orch.generate("q", &[], "ctx", citations()).await.unwrap();
        assert_eq!(gen.provider, ServedBy::Degraded);
        assert_eq!(gen.answer, DEGRADED_ANSWER);
        assert_eq!(gen.sources, citations());
        assert_eq!(usage.snapshot().degraded_answers, 1);
    }

    #[tokio::test]
    async fn test_long_question_rejected_without_calls() {
        let primary = ScriptedGenerator::new(Some("x"));
        let secondary = ScriptedGenerator::new(Some("x"));
        let orch = orchestrator(primary.clone(), secondary.clone(), Arc::new(UsageCounters::new()));

        assert!(orch.validate(&"a".repeat(200)).is_ok());
        let err = orch
            .generate(&"a".repeat(201), &[], "ctx", citations())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InputRejected { len: 201, max: 200 }));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_validate_counts_characters() {
        let orch = orchestrator(
            ScriptedGenerator::new(None),
            ScriptedGenerator::new(None),
            Arc::new(UsageCounters::new()),
        );
        // 200 two-byte characters is within the limit
        assert!(orch.validate(&"é".repeat(200)).is_ok());
    }

    #[tokio::test]
    async fn test_prompt_layout() {
        let primary = ScriptedGenerator::new(Some("ok"));
        let orch = orchestrator(
            primary.clone(),
            ScriptedGenerator::new(None),
            Arc::new(UsageCounters::new()),
        );
        let history = vec![
            ConversationTurn { role: Role::User, content: "hi".into() },
            ConversationTurn { role: Role::Model, content: "hello".into() },
        ];
        orch.generate("How many days?", &history, "[vacation.md]\n15 days", citations())
            .await
            .unwrap();

        let sent = primary.last_messages.lock().unwrap().clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].role, MessageRole::System);
        assert_eq!(
            sent[0].content,
            "Answer from the sources.\n\n### Source data:\n[vacation.md]\n15 days"
        );
        assert_eq!(sent[1].role, MessageRole::User);
        assert_eq!(sent[2].role, MessageRole::Assistant);
        assert_eq!(sent[3].content, "How many days?");
    }

    #[tokio::test]
    async fn test_answer_capped_by_output_budget() {
        let long: &'static str = Box::leak("y".repeat(50).into_boxed_str());
        let tiers: Vec<Arc<dyn GenerationProvider>> = vec![ScriptedGenerator::new(Some(long))];
        let orch = Orchestrator::new(tiers, String::new(), 200, 5, 0.0, Arc::new(UsageCounters::new()));
        let gen = orch.generate("q", &[], "", vec![]).await.unwrap();
        assert_eq!(gen.answer.chars().count(), 20);
    }

    #[test]
    fn test_gemini_request_body() {
        let messages = vec![
            Message { role: MessageRole::System, content: "Be brief.".into() },
            Message { role: MessageRole::User, content: "Hello".into() },
            Message { role: MessageRole::Assistant, content: "Hi".into() },
            Message { role: MessageRole::User, content: "Days?".into() },
        ];
        let body = GeminiGenerator::build_request_body(&messages, 0.2, 400);

        assert_eq!(body["system_instruction"]["parts"][0]["text"], "Be brief.");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "Days?");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 400);
    }

    #[test]
    fn test_openai_request_body() {
        let messages = vec![
            Message { role: MessageRole::System, content: "Be brief.".into() },
            Message { role: MessageRole::Assistant, content: "Hi".into() },
        ];
        let body = OpenAiGenerator::build_request_body("gpt-4o-mini", &messages, 0.2, 400);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["max_tokens"], 400);
    }

    #[test]
    fn test_parse_gemini_completion() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Fifteen " }, { "text": "days." }] } }],
            "usageMetadata": { "totalTokenCount": 42 }
        });
        let c = parse_gemini_completion(&resp, &[]).unwrap();
        assert_eq!(c.text, "Fifteen days.");
        assert_eq!(c.tokens, 42);

        let blocked = json!({ "candidates": [] });
        assert!(matches!(
            parse_gemini_completion(&blocked, &[]),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}
