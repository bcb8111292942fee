//! AI extraction of task candidates from a voice memo or text.
//!
//! The service is asked for a JSON object `{summary, tasks}`. Its reply is
//! validated here, at the boundary; nothing downstream sees raw JSON.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::Candidate;
use crate::settings::ExtractionSettings;

const DEFAULT_MIME_TYPE: &str = "audio/webm";
const DEFAULT_SUMMARY: &str = "Processed capture";

/// Raw capture handed to the extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureInput {
    Audio { bytes: Vec<u8>, mime_type: String },
    Text(String),
}

/// A validated extraction reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Ok { summary: String, tasks: Vec<Candidate> },
    /// The service answered but declined, with its own explanation.
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("extraction is disabled: no API key configured")]
    NotConfigured,
}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        ExtractionError::Transport(e.without_url().to_string())
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract the complete candidate list. `context` is the current list
    /// when refining; the reply replaces it wholesale.
    async fn extract(
        &self,
        input: &CaptureInput,
        context: &[Candidate],
        now: DateTime<Utc>,
    ) -> Result<ExtractionOutcome, ExtractionError>;
}

/// Used when no API key is configured. Every capture fails with an
/// actionable message instead of the server refusing to start.
pub struct DisabledExtractor;

#[async_trait]
impl Extractor for DisabledExtractor {
    async fn extract(
        &self,
        _input: &CaptureInput,
        _context: &[Candidate],
        _now: DateTime<Utc>,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        Err(ExtractionError::NotConfigured)
    }
}

// ── Gemini ─────────────────────────────────────────────────────

/// The key travels in a header so it never shows up in a logged URL.
const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiExtractor {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiExtractor {
    pub fn new(settings: &ExtractionSettings, api_key: String) -> Result<Self, ExtractionError> {
        if api_key.is_empty() {
            return Err(ExtractionError::NotConfigured);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(GeminiExtractor {
            client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }

    fn request_body(input: &CaptureInput, context: &[Candidate], now: DateTime<Utc>) -> GenerateRequest {
        let mut parts = vec![Part::Text { text: build_prompt(input, context, now) }];
        if let CaptureInput::Audio { bytes, mime_type } = input {
            let mime_type = if mime_type.is_empty() { DEFAULT_MIME_TYPE } else { mime_type };
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: mime_type.to_string(),
                    data: STANDARD.encode(bytes),
                },
            });
        }

        GenerateRequest {
            contents: vec![Content { role: "user".to_string(), parts }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: response_schema(),
            },
        }
    }
}

#[async_trait]
impl Extractor for GeminiExtractor {
    async fn extract(
        &self,
        input: &CaptureInput,
        context: &[Candidate],
        now: DateTime<Utc>,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let body = Self::request_body(input, context, now);

        debug!(model = %self.model, refinement = !context.is_empty(), "sending extraction request");
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let e = ExtractionError::from(e);
                error!(error = %e, "extraction request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), %body, "extraction service error");
            return Err(ExtractionError::Service { status: status.as_u16(), body });
        }

        let reply: GenerateResponse = response.json().await?;
        let text = reply
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.iter().find_map(|p| p.text.as_deref()))
            .ok_or_else(|| ExtractionError::Malformed("no content in reply".to_string()))?;
        debug!(reply = text, "extraction reply");

        parse_reply(text)
    }
}

fn build_prompt(input: &CaptureInput, context: &[Candidate], now: DateTime<Utc>) -> String {
    let refinement = !context.is_empty();
    let context_json = serde_json::to_string(context).unwrap_or_else(|_| "[]".to_string());
    let source = match input {
        CaptureInput::Audio { .. } => "the attached audio".to_string(),
        CaptureInput::Text(text) => format!("this text: {text}"),
    };
    format!(
        "Current date: {now}.\n\
         Mode: {mode}.\n\
         Existing context (JSON): {context_json}\n\n\
         Instructions:\n\
         1. Analyze the user's input, {source}.\n\
         2. For a new capture, extract actionable tasks.\n\
         3. For a refinement, modify the existing context list according to the user's instructions.\n\
         4. Return the complete final list of tasks.\n\n\
         Reply with JSON: {{\"summary\": \"short friendly summary, e.g. 'Found 3 tasks'\", \
         \"tasks\": [{{\"content\": \"actionable title\", \"dueAt\": \"ISO 8601 date or null\", \
         \"responsible\": \"name or null\", \"notes\": \"details or null\"}}]}}",
        now = now.to_rfc3339(),
        mode = if refinement { "REFINEMENT" } else { "NEW CAPTURE" },
    )
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "summary": { "type": "STRING" },
            "error": { "type": "STRING" },
            "tasks": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "content": { "type": "STRING" },
                        "dueAt": { "type": "STRING" },
                        "responsible": { "type": "STRING" },
                        "notes": { "type": "STRING" }
                    },
                    "required": ["content"]
                }
            }
        }
    })
}

// ── Reply parsing ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
    tasks: Option<Vec<RawTask>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    content: String,
    #[serde(default)]
    due_at: Option<String>,
    #[serde(default)]
    responsible: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

/// Validate a reply into an outcome. A reply without a `tasks` array, or
/// with a date that cannot be read, is malformed.
pub fn parse_reply(text: &str) -> Result<ExtractionOutcome, ExtractionError> {
    let raw: RawReply = serde_json::from_str(extract_json(text))
        .map_err(|e| ExtractionError::Malformed(e.to_string()))?;

    if let Some(message) = raw.error.and_then(non_blank) {
        return Ok(ExtractionOutcome::Error { message });
    }
    let Some(raw_tasks) = raw.tasks else {
        return Err(ExtractionError::Malformed("missing tasks".to_string()));
    };

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for raw_task in raw_tasks {
        let Some(content) = non_blank(raw_task.content) else {
            continue;
        };
        let due_at = match raw_task.due_at.and_then(non_blank) {
            Some(s) if s.eq_ignore_ascii_case("null") => None,
            Some(s) => Some(parse_due(&s).ok_or_else(|| ExtractionError::Malformed(format!("bad dueAt {s:?}")))?),
            None => None,
        };
        tasks.push(Candidate {
            id: Uuid::new_v4(),
            content,
            due_at,
            responsible: raw_task.responsible.and_then(non_blank),
            notes: raw_task.notes.and_then(non_blank),
        });
    }

    let summary = raw.summary.and_then(non_blank).unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
    Ok(ExtractionOutcome::Ok { summary, tasks })
}

/// RFC 3339, or a zone-less date-time / plain date read as UTC.
fn parse_due(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after_start = &trimmed[start + 3..];
        let json_start = if after_start.starts_with("json") {
            after_start.find('\n').map(|i| i + 1).unwrap_or(0)
        } else if after_start.starts_with('\n') {
            1
        } else {
            0
        };
        let content = &after_start[json_start..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }

    trimmed
}

/// Turn a failure into a message the user can act on.
pub fn classify_failure(err: &ExtractionError) -> String {
    const QUOTA: &str = "The AI service quota is exhausted. Try again later.";
    const AUTH: &str = "The AI service rejected the server's API key. Check the configuration.";
    const DISABLED: &str = "AI extraction is not enabled on this server.";
    const GENERIC: &str = "Could not process the capture. Try again.";

    match err {
        ExtractionError::NotConfigured => return DISABLED.to_string(),
        ExtractionError::Service { status: 429, .. } => return QUOTA.to_string(),
        ExtractionError::Service { status: 401 | 403, .. } => return AUTH.to_string(),
        _ => {}
    }

    let text = err.to_string().to_lowercase();
    if text.contains("quota") || text.contains("resource_exhausted") {
        QUOTA.to_string()
    } else if text.contains("api key") || text.contains("permission_denied") || text.contains("unauthenticated") {
        AUTH.to_string()
    } else if text.contains("disabled") {
        DISABLED.to_string()
    } else {
        GENERIC.to_string()
    }
}

// ── Gemini wire types ──────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    response_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ReplyCandidate>,
}

#[derive(Debug, Deserialize)]
struct ReplyCandidate {
    content: Option<ReplyContent>,
}

#[derive(Debug, Deserialize)]
struct ReplyContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Debug, Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn transport_error_does_not_leak_key() {
        let settings = ExtractionSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "m".to_string(),
            request_timeout_secs: 5,
            ..ExtractionSettings::default()
        };
        let extractor = GeminiExtractor::new(&settings, "SUPERSECRETKEY".to_string()).unwrap();

        let err = extractor
            .extract(&CaptureInput::Text("buy milk".to_string()), &[], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Transport(_)));
        let text = err.to_string();
        assert!(!text.contains("SUPERSECRETKEY"), "{text}");
    }

    #[test]
    fn parses_plain_reply() {
        let outcome = parse_reply(r#"{
            "summary": "Found 2 tasks",
            "tasks": [
                {"content": "Book dentist", "dueAt": "2026-02-12T09:00:00Z", "responsible": "Ana"},
                {"content": "Email Sam", "dueAt": null, "notes": "  "}
            ]
        }"#).unwrap();

        let ExtractionOutcome::Ok { summary, tasks } = outcome else {
            panic!("expected Ok outcome");
        };
        assert_eq!(summary, "Found 2 tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].due_at, Some(Utc.with_ymd_and_hms(2026, 2, 12, 9, 0, 0).unwrap()));
        assert_eq!(tasks[0].responsible.as_deref(), Some("Ana"));
        assert_eq!(tasks[1].due_at, None);
        assert_eq!(tasks[1].notes, None);
        assert_ne!(tasks[0].id, tasks[1].id);
    }

    #[test]
    fn strips_code_fence() {
        let outcome = parse_reply("```json\n{\"summary\": \"ok\", \"tasks\": []}\n```").unwrap();
        assert_eq!(outcome, ExtractionOutcome::Ok { summary: "ok".into(), tasks: vec![] });
    }

    #[test]
    fn zone_less_dates_are_utc() {
        let outcome = parse_reply(r#"{"tasks": [{"content": "Pay rent", "dueAt": "2026-03-01"}]}"#).unwrap();
        let ExtractionOutcome::Ok { summary, tasks } = outcome else {
            panic!("expected Ok outcome");
        };
        assert_eq!(summary, DEFAULT_SUMMARY);
        assert_eq!(tasks[0].due_at, Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn malformed_replies_rejected() {
        assert!(matches!(parse_reply("not json"), Err(ExtractionError::Malformed(_))));
        assert!(matches!(parse_reply(r#"{"summary": "hi"}"#), Err(ExtractionError::Malformed(_))));
        assert!(matches!(
            parse_reply(r#"{"tasks": [{"content": "x", "dueAt": "someday"}]}"#),
            Err(ExtractionError::Malformed(_))
        ));
    }

    #[test]
    fn service_reported_error() {
        let outcome = parse_reply(r#"{"error": "Audio was silent"}"#).unwrap();
        assert_eq!(outcome, ExtractionOutcome::Error { message: "Audio was silent".into() });
    }

    #[test]
    fn failures_classified() {
        let quota = ExtractionError::Service { status: 429, body: String::new() };
        assert!(classify_failure(&quota).contains("quota"));

        let quota_body = ExtractionError::Service { status: 400, body: "RESOURCE_EXHAUSTED: Quota exceeded".into() };
        assert!(classify_failure(&quota_body).contains("quota"));

        let auth = ExtractionError::Service { status: 400, body: "API key not valid".into() };
        assert!(classify_failure(&auth).contains("API key"));

        assert!(classify_failure(&ExtractionError::NotConfigured).contains("not enabled"));
        assert_eq!(
            classify_failure(&ExtractionError::Transport("connection reset".into())),
            "Could not process the capture. Try again."
        );
    }

    #[test]
    fn audio_request_carries_inline_data() {
        let input = CaptureInput::Audio { bytes: vec![1, 2, 3], mime_type: String::new() };
        let body = serde_json::to_value(GeminiExtractor::request_body(&input, &[], Utc::now())).unwrap();
        let parts = &body["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("NEW CAPTURE"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "audio/webm");
        assert_eq!(parts[1]["inlineData"]["data"], "AQID");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }
}
