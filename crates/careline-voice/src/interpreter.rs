//! Intent interpreter: free-form utterance → `{intent, reply, action?}`.
//!
//! The production backend is any OpenAI-compatible `/chat/completions` endpoint asked
//! to answer with a single JSON object. The resolver owns the timeout and the
//! apology fallback; interpreters just report what went wrong.

use crate::action::ActionDescriptor;
use crate::context::CommandContext;
use crate::error::InterpreterError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Structured result of interpreting one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub intent: String,
    pub reply: String,
    #[serde(default)]
    pub action: Option<ActionDescriptor>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// The `interpretIntent` capability.
#[async_trait::async_trait]
pub trait IntentInterpreter: Send + Sync {
    async fn interpret(
        &self,
        text: &str,
        ctx: &CommandContext,
    ) -> Result<Interpretation, InterpreterError>;
}

/// Interpreter used when no API key is configured; every call fails, so the
/// resolver answers with its apology.
#[derive(Debug, Default)]
pub struct OfflineInterpreter;

#[async_trait::async_trait]
impl IntentInterpreter for OfflineInterpreter {
    async fn interpret(
        &self,
        _text: &str,
        _ctx: &CommandContext,
    ) -> Result<Interpretation, InterpreterError> {
        Err(InterpreterError::NotConfigured(
            "set INTERPRETER_API_KEY to enable free-form commands".to_string(),
        ))
    }
}

// OpenAI-compatible request/response
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat interpreter.
/// Env: `INTERPRETER_API_URL` (default https://api.openai.com/v1), `INTERPRETER_API_KEY`
/// (or `OPENAI_API_KEY`), `INTERPRETER_MODEL` (default gpt-4o-mini).
pub struct ChatIntentInterpreter {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ChatIntentInterpreter {
    /// Returns `None` when no key is configured.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("INTERPRETER_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()?;
        let key = key.trim().to_string();
        if key.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("INTERPRETER_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let model =
            std::env::var("INTERPRETER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Some(Self::new(base_url, key, model))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        // Connect timeout only; the resolver bounds the whole call.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    fn system_prompt(ctx: &CommandContext) -> String {
        let mut prompt = format!(
            "You are the voice assistant of a healthcare portal. The signed-in user is a {}. \
             Answer with one JSON object and nothing else: \
             {{\"intent\": string, \"reply\": string, \"action\": object|null, \"confidence\": number}}. \
             `reply` is one or two short spoken sentences. \
             `action` is optional and must be one of: \
             {{\"kind\":\"navigate\",\"view\":\"dashboard|labs|appointments|messages|medications|billing|patients|schedule|notes|employees|users|audit_log|settings\"}}, \
             {{\"kind\":\"start_dictation\"}}, \
             {{\"kind\":\"send_message\",\"to\":string,\"body\":string}}, \
             {{\"kind\":\"create_record\",\"record\":string,\"fields\":object}}, \
             {{\"kind\":\"logout\"}}. \
             Never invent clinical facts.",
            ctx.role
        );
        if let Some(last) = ctx.last_intent() {
            prompt.push_str(&format!(" The previous request in this session was `{}`.", last));
        }
        prompt
    }
}

#[async_trait::async_trait]
impl IntentInterpreter for ChatIntentInterpreter {
    async fn interpret(
        &self,
        text: &str,
        ctx: &CommandContext,
    ) -> Result<Interpretation, InterpreterError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_prompt(ctx),
                },
                ChatMessage {
                    role: "user",
                    content: text.to_string(),
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(InterpreterError::Status { status, body });
        }

        let chat: ChatResponse = res.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InterpreterError::Malformed("no choices in response".to_string()))?;
        debug!(model = %self.model, "Interpreter answered");
        parse_interpretation(&content)
    }
}

/// Parse the model's JSON answer, tolerating a surrounding markdown code fence.
pub fn parse_interpretation(raw: &str) -> Result<Interpretation, InterpreterError> {
    let trimmed = strip_code_fence(raw.trim());
    let parsed: Interpretation = serde_json::from_str(trimmed)
        .map_err(|e| InterpreterError::Malformed(format!("{}: {}", e, truncate(trimmed, 120))))?;
    if parsed.reply.trim().is_empty() {
        return Err(InterpreterError::Malformed("empty reply".to_string()));
    }
    Ok(parsed)
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::View;
    use crate::context::Role;

    #[test]
    fn parses_plain_and_fenced_json() {
        let plain = r#"{"intent":"schedule_query","reply":"You have 4 appointments tomorrow."}"#;
        let parsed = parse_interpretation(plain).unwrap();
        assert_eq!(parsed.intent, "schedule_query");
        assert!(parsed.action.is_none());

        let fenced = "```json\n{\"intent\":\"open_labs\",\"reply\":\"Opening labs.\",\"action\":{\"kind\":\"navigate\",\"view\":\"labs\"},\"confidence\":0.9}\n```";
        let parsed = parse_interpretation(fenced).unwrap();
        assert_eq!(parsed.action, Some(ActionDescriptor::navigate(View::Labs)));
        assert_eq!(parsed.confidence, Some(0.9));
    }

    #[test]
    fn malformed_answers_are_rejected() {
        assert!(matches!(
            parse_interpretation("Sure! You have 4 appointments."),
            Err(InterpreterError::Malformed(_))
        ));
        assert!(matches!(
            parse_interpretation(r#"{"intent":"x","reply":"  "}"#),
            Err(InterpreterError::Malformed(_))
        ));
    }

    #[test]
    fn prompt_mentions_role_and_last_intent() {
        let mut ctx = CommandContext::new(Role::Provider, "dr-7");
        ctx.session_memory.remember(crate::context::LAST_INTENT_KEY, "schedule_query");
        let prompt = ChatIntentInterpreter::system_prompt(&ctx);
        assert!(prompt.contains("provider"));
        assert!(prompt.contains("schedule_query"));
    }

    #[tokio::test]
    async fn offline_interpreter_always_fails() {
        let ctx = CommandContext::new(Role::Patient, "p-1");
        let err = OfflineInterpreter.interpret("hello there", &ctx).await.unwrap_err();
        assert!(matches!(err, InterpreterError::NotConfigured(_)));
    }
}
