//! AI progress summaries and chat rubric scoring.
//!
//! Requests go through [`CompletionClient`] as a chat completion. Replies are
//! parsed with [`StructuredParser`] first and [`HeuristicParser`] second, so a
//! malformed reply degrades to a best-effort split instead of an error.

use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{HttpClient, HttpError, ValidatedUrl};
use crate::config::CompletionConfig;
use crate::journal::Journal;
use crate::model::{Category, LogEntry};
use crate::offline_store::{LocalBlob, StoreError};
use crate::AppResult;

pub const RECENT_LIMIT: usize = 10;

const SYSTEM_PROMPT: &str = "You are a helpful healthcare assistant.";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SummaryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("completion request failed: {0}")]
    Http(#[from] HttpError),

    #[error("could not encode patient data: {0}")]
    Encode(String),
}

impl SummaryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SummaryError::Http(e) if e.is_retryable())
    }
}

impl From<StoreError> for SummaryError {
    fn from(e: StoreError) -> Self {
        SummaryError::Encode(e.to_string())
    }
}

// --- Completion client ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

/// Chat-completion client. Holds the API key for its lifetime; the key is
/// sent only as a bearer token.
pub struct CompletionClient {
    http: Arc<dyn HttpClient>,
    endpoint: ValidatedUrl,
    config: CompletionConfig,
    api_key: SecretString,
}

impl CompletionClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        config: CompletionConfig,
        api_key: SecretString,
    ) -> Result<Self, SummaryError> {
        let endpoint = ValidatedUrl::new(config.endpoint.as_str())?;
        Ok(Self {
            http,
            endpoint,
            config,
            api_key,
        })
    }

    pub fn structured_output(&self) -> bool {
        self.config.structured_output
    }

    /// Sends `system` + `user` and returns the first choice's content, or an
    /// empty string when the reply carries none.
    #[instrument(skip_all, fields(model = %self.config.model, json_mode = json_mode))]
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String, SummaryError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let body =
            serde_json::to_value(&request).map_err(|e| SummaryError::Encode(e.to_string()))?;

        let reply = self
            .http
            .post_json(&self.endpoint, Some(&self.api_key), &body)
            .await?;

        let content = reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(len = content.len(), "Completion received");
        Ok(content)
    }
}

// --- Parsing ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub overview: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ProgressSummary {
    pub fn is_empty(&self) -> bool {
        self.overview.is_empty() && self.recommendations.is_empty()
    }
}

/// Turns a completion reply into a summary. `None` means the parser found
/// nothing it recognises.
pub trait SummaryParser {
    fn parse(&self, reply: &str) -> Option<ProgressSummary>;
}

/// Expects `{"overview": .., "recommendations": [..]}`, optionally wrapped in
/// a Markdown code fence.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredParser;

impl SummaryParser for StructuredParser {
    fn parse(&self, reply: &str) -> Option<ProgressSummary> {
        let mut summary: ProgressSummary = serde_json::from_str(strip_fence(reply)).ok()?;
        summary.overview = summary.overview.trim().to_string();
        summary.recommendations = summary
            .recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        (!summary.is_empty()).then_some(summary)
    }
}

/// Line-based split of free text: numbered or bulleted lines are
/// recommendations, everything else is overview.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicParser;

impl SummaryParser for HeuristicParser {
    fn parse(&self, reply: &str) -> Option<ProgressSummary> {
        let mut overview = Vec::new();
        let mut recommendations = Vec::new();

        for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match strip_list_marker(line) {
                Some(rest) => recommendations.push(rest.to_string()),
                None => overview.push(line),
            }
        }

        let summary = ProgressSummary {
            overview: overview.join(" "),
            recommendations,
        };
        (!summary.is_empty()).then_some(summary)
    }
}

fn strip_fence(reply: &str) -> &str {
    let text = reply.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// `1. text`, `- text`, `* text`, `• text` → `text`. The marker must be
/// followed by whitespace.
fn strip_list_marker(line: &str) -> Option<&str> {
    let rest = if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        rest
    } else {
        let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix('.')?
    };

    rest.starts_with(char::is_whitespace)
        .then(|| rest.trim_start())
}

/// Structured parse, then heuristic split, then the empty summary.
pub fn parse_summary(reply: &str) -> ProgressSummary {
    StructuredParser
        .parse(reply)
        .or_else(|| HeuristicParser.parse(reply))
        .unwrap_or_default()
}

// --- Inputs ---

/// Up to [`RECENT_LIMIT`] newest entries per category, rendered for a prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentActivity {
    pub goals: Vec<LogEntry>,
    pub bladder: Vec<LogEntry>,
    pub pain: Vec<LogEntry>,
    pub mood: Vec<LogEntry>,
}

fn field(entry: &LogEntry, name: &str) -> String {
    match entry.fields.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn or_none(joined: String) -> String {
    if joined.is_empty() {
        "None".into()
    } else {
        joined
    }
}

impl RecentActivity {
    pub async fn collect(journal: &Journal) -> AppResult<Self> {
        Ok(Self {
            goals: journal.recent(Category::Goal, RECENT_LIMIT).await?,
            bladder: journal.recent(Category::Bladder, RECENT_LIMIT).await?,
            pain: journal.recent(Category::Pain, RECENT_LIMIT).await?,
            mood: journal.recent(Category::Mood, RECENT_LIMIT).await?,
        })
    }

    pub fn goals_text(&self) -> String {
        or_none(
            self.goals
                .iter()
                .map(|e| field(e, "text"))
                .collect::<Vec<_>>()
                .join("\n- "),
        )
    }

    pub fn bladder_text(&self) -> String {
        or_none(
            self.bladder
                .iter()
                .map(|e| field(e, "time"))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    pub fn pain_text(&self) -> String {
        or_none(
            self.pain
                .iter()
                .map(|e| {
                    format!(
                        "{} at {} (rating {})",
                        field(e, "type"),
                        field(e, "location"),
                        field(e, "rating")
                    )
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn mood_text(&self) -> String {
        or_none(
            self.mood
                .iter()
                .map(|e| format!("Mood {}/10: \"{}\"", field(e, "mood"), field(e, "journal")))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn render(&self) -> String {
        format!(
            "Goals:\n- {}\n\nBladder entries: {}\n\nPain logs: {}\n\nMental health entries: {}\n",
            self.goals_text(),
            self.bladder_text(),
            self.pain_text(),
            self.mood_text()
        )
    }
}

fn summary_prompt(data_label: &str, data: &str, structured: bool) -> String {
    let format = if structured {
        "Respond with JSON only, in the form \
         {\"overview\": string, \"recommendations\": [string]}.\n"
    } else {
        ""
    };
    format!(
        "You are a clinical assistant. Using the {data_label} below, write:\n\
         1. A concise progress overview (≤120 words).\n\
         2. 5–7 bullet-point recommendations for the next two weeks.\n\
         {format}\n\
         {data}\n"
    )
}

// --- Rubric ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub from: Speaker,
    pub text: String,
}

/// Participation scores, each 1..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RubricScores {
    pub clarity: u8,
    pub responsiveness: u8,
    pub insight: u8,
    pub engagement: u8,
}

impl RubricScores {
    fn in_range(&self) -> bool {
        [self.clarity, self.responsiveness, self.insight, self.engagement]
            .iter()
            .all(|s| (1..=10).contains(s))
    }
}

fn rubric_prompt(turns: &[ChatTurn]) -> String {
    let mut prompt = String::from(
        "You are a caring mental health coach.\n\
         Based on the following conversation between a user and an AI assistant, please score \
         the user's participation on a scale of 1–10 (10 best) for each of these criteria:\n\
         1. Clarity of expressing feelings\n\
         2. Responsiveness to guidance\n\
         3. Emotional insight\n\
         4. Overall engagement\n\n\
         Respond with JSON only, for example:\n\
         {\"Clarity\":8,\"Responsiveness\":7,\"Insight\":9,\"Engagement\":8}\n\n\
         Conversation:\n",
    );
    for turn in turns {
        let speaker = match turn.from {
            Speaker::User => "User",
            Speaker::Bot => "AI",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&turn.text);
        prompt.push('\n');
    }
    prompt
}

// --- Service ---

pub struct Summarizer {
    client: CompletionClient,
}

impl Summarizer {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    async fn summarize(&self, prompt: &str) -> Result<ProgressSummary, SummaryError> {
        let structured = self.client.structured_output();
        let reply = self.client.complete(SYSTEM_PROMPT, prompt, structured).await?;
        let summary = parse_summary(&reply);
        if summary.is_empty() {
            warn!("Completion reply had no usable content");
        }
        Ok(summary)
    }

    /// Summarises the whole local blob, sent as pretty-printed JSON.
    #[instrument(skip_all)]
    pub async fn summarize_blob(&self, blob: &LocalBlob) -> Result<ProgressSummary, SummaryError> {
        let data = blob.to_pretty_json()?;
        let prompt = summary_prompt(
            "structured JSON patient data",
            &format!("JSON:\n{data}"),
            self.client.structured_output(),
        );
        let summary = self.summarize(&prompt).await?;
        info!(
            recommendations = summary.recommendations.len(),
            "Summary generated from local data"
        );
        Ok(summary)
    }

    #[instrument(skip_all)]
    pub async fn summarize_recent(&self, activity: &RecentActivity) -> Result<ProgressSummary, SummaryError> {
        let prompt = summary_prompt(
            "patient's recent entries",
            &activity.render(),
            self.client.structured_output(),
        );
        let summary = self.summarize(&prompt).await?;
        info!(
            recommendations = summary.recommendations.len(),
            "Summary generated from recent entries"
        );
        Ok(summary)
    }

    /// Scores the user's side of a conversation. `Ok(None)` when the reply
    /// is not a valid rubric.
    #[instrument(skip_all, fields(turns = turns.len()))]
    pub async fn score_chats(&self, turns: &[ChatTurn]) -> Result<Option<RubricScores>, SummaryError> {
        if turns.is_empty() {
            return Err(SummaryError::InvalidInput(
                "conversation must contain at least one message".into(),
            ));
        }

        let reply = self
            .client
            .complete(SYSTEM_PROMPT, &rubric_prompt(turns), true)
            .await?;

        let scores = serde_json::from_str::<RubricScores>(strip_fence(&reply))
            .ok()
            .filter(RubricScores::in_range);
        if scores.is_none() {
            warn!("Rubric reply did not parse");
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ScriptedHttpClient;
    use crate::model::{EntryId, UnixTimeMs};
    use serde_json::json;

    fn reply(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    fn summarizer(http: Arc<ScriptedHttpClient>, structured: bool) -> Summarizer {
        let config = CompletionConfig {
            structured_output: structured,
            ..CompletionConfig::default()
        };
        let client =
            CompletionClient::new(http, config, SecretString::new("sk-test".into())).unwrap();
        Summarizer::new(client)
    }

    fn entry(category: Category, fields: Value) -> LogEntry {
        LogEntry {
            id: EntryId::generate(),
            category,
            created_at: UnixTimeMs(1),
            fields: fields.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn structured_parser_accepts_fenced_json() {
        let text = "```json\n{\"overview\": \"Stable week.\", \"recommendations\": [\"Hydrate\", \" \"]}\n```";
        let summary = StructuredParser.parse(text).unwrap();
        assert_eq!(summary.overview, "Stable week.");
        assert_eq!(summary.recommendations, vec!["Hydrate"]);
        assert!(StructuredParser.parse("not json").is_none());
    }

    #[test]
    fn numbered_reply_splits_overview_and_recommendations() {
        let summary =
            parse_summary("Progress is steady.\n1. Do more stretching\n2. Track pain daily");
        assert_eq!(summary.overview, "Progress is steady.");
        assert_eq!(
            summary.recommendations,
            vec!["Do more stretching", "Track pain daily"]
        );
    }

    #[test]
    fn heuristic_parser_splits_lists_from_prose() {
        let text = "Overall progress is good.\nPain is stable.\n\n1. Keep stretching\n- Drink water\n* Sleep early\n• Log mood daily\n2.No space here";
        let summary = HeuristicParser.parse(text).unwrap();
        assert_eq!(
            summary.overview,
            "Overall progress is good. Pain is stable. 2.No space here"
        );
        assert_eq!(
            summary.recommendations,
            vec!["Keep stretching", "Drink water", "Sleep early", "Log mood daily"]
        );
    }

    #[test]
    fn unparsable_reply_degrades_to_empty() {
        assert!(parse_summary("   \n  ").is_empty());
        assert_eq!(parse_summary("just prose").overview, "just prose");
    }

    #[test]
    fn recent_activity_renders_each_category() {
        let activity = RecentActivity {
            goals: vec![
                entry(Category::Goal, json!({"text": "walk"})),
                entry(Category::Goal, json!({"text": "stretch"})),
            ],
            bladder: vec![
                entry(Category::Bladder, json!({"time": "08:00 AM"})),
                entry(Category::Bladder, json!({"time": "02:00 PM"})),
            ],
            pain: vec![entry(
                Category::Pain,
                json!({"type": "burning", "location": "legs", "rating": 6}),
            )],
            mood: vec![],
        };

        assert_eq!(activity.goals_text(), "walk\n- stretch");
        assert_eq!(activity.bladder_text(), "08:00 AM, 02:00 PM");
        assert_eq!(activity.pain_text(), "burning at legs (rating 6)");
        assert_eq!(activity.mood_text(), "None");
        assert!(activity.render().starts_with("Goals:\n- walk\n- stretch\n"));
    }

    #[tokio::test]
    async fn summarize_blob_sends_structured_request() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Ok(reply(
            r#"{"overview": "Doing well.", "recommendations": ["Rest", "Hydrate"]}"#,
        )));
        let summarizer = summarizer(http.clone(), true);

        let summary = summarizer.summarize_blob(&LocalBlob::default()).await.unwrap();
        assert_eq!(summary.overview, "Doing well.");
        assert_eq!(summary.recommendations.len(), 2);

        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].authorized);
        let body = &requests[0].body;
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["content"], SYSTEM_PROMPT);
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("JSON:\n{}"));
    }

    #[tokio::test]
    async fn free_text_reply_uses_heuristic_split() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Ok(reply("Good week.\n1. Rest\n2. Hydrate")));
        let summarizer = summarizer(http.clone(), false);

        let summary = summarizer
            .summarize_recent(&RecentActivity::default())
            .await
            .unwrap();
        assert_eq!(summary.overview, "Good week.");
        assert_eq!(summary.recommendations, vec!["Rest", "Hydrate"]);
        assert!(http.requests()[0].body.get("response_format").is_none());
    }

    #[tokio::test]
    async fn http_failure_is_reported() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Err(HttpError::status(503, "overloaded")));
        let summarizer = summarizer(http, true);

        let err = summarizer
            .summarize_blob(&LocalBlob::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn score_chats_rejects_empty_conversation() {
        let summarizer = summarizer(Arc::new(ScriptedHttpClient::new()), true);
        assert!(matches!(
            summarizer.score_chats(&[]).await,
            Err(SummaryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn score_chats_parses_rubric() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Ok(reply(
            r#"{"Clarity":8,"Responsiveness":7,"Insight":9,"Engagement":8}"#,
        )));
        http.push_response(Ok(reply("I think they did great!")));
        let summarizer = summarizer(http.clone(), true);
        let turns = vec![
            ChatTurn {
                from: Speaker::User,
                text: "I felt low today".into(),
            },
            ChatTurn {
                from: Speaker::Bot,
                text: "What helped yesterday?".into(),
            },
        ];

        let scores = summarizer.score_chats(&turns).await.unwrap().unwrap();
        assert_eq!(scores.insight, 9);

        let prompt = http.requests()[0].body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(prompt.ends_with("User: I felt low today\nAI: What helped yesterday?\n"));

        assert_eq!(summarizer.score_chats(&turns).await.unwrap(), None);
    }
}
