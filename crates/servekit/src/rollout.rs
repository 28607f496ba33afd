//! Concurrent chat-completion rollouts against the launched server.
//!
//! Purpose
//! - Drive an OpenAI-compatible `/chat/completions` endpoint with a batch of
//!   single-turn conversations, bounded to `concurrency` requests in flight.
//! - Record output text, wall time, and token usage per conversation, returned
//!   in input order regardless of completion order.
//!
//! Code cross-refs: `dataset::read_jsonl` (inputs), `ServeConfig` (server side).

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/v1";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen3-8B";
pub const DEFAULT_CONCURRENCY: usize = 32;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum RolloutError {
    InvalidConfig { reason: String },
    /// Input record `index` has no string `instruction` field.
    MissingInstruction { index: usize },
    Client(reqwest::Error),
    Request { index: usize, source: reqwest::Error },
    Status { index: usize, status: u16, body: String },
    EmptyChoices { index: usize },
    Io(io::Error),
}

impl fmt::Display for RolloutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid rollout config: {reason}"),
            Self::MissingInstruction { index } => {
                write!(f, "record {index}: missing string field `instruction`")
            }
            Self::Client(e) => write!(f, "building http client: {e}"),
            Self::Request { index, source } => write!(f, "request {index}: {source}"),
            Self::Status {
                index,
                status,
                body,
            } => write!(f, "request {index}: http {status}: {body}"),
            Self::EmptyChoices { index } => write!(f, "request {index}: response has no choices"),
            Self::Io(e) => write!(f, "writing rollout output: {e}"),
        }
    }
}

impl std::error::Error for RolloutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Client(e) | Self::Request { source: e, .. } => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One finished conversation. Field names follow the output file layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub input: Vec<ChatMessage>,
    pub output: Option<String>,
    /// Wall-clock seconds for the request.
    pub time: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug)]
pub struct RolloutConfig {
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when non-empty.
    pub api_key: String,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    n: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Turn `{"instruction": ...}` records into single user-turn conversations.
pub fn conversations_from_records(records: &[Value]) -> Result<Vec<Vec<ChatMessage>>, RolloutError> {
    records
        .iter()
        .enumerate()
        .map(|(index, r)| {
            r.get("instruction")
                .and_then(Value::as_str)
                .map(|s| vec![ChatMessage::user(s)])
                .ok_or(RolloutError::MissingInstruction { index })
        })
        .collect()
}

/// Pretty JSON array, 4-space indent, non-ASCII written as-is.
pub fn write_records<W: Write>(writer: W, records: &[RolloutRecord]) -> Result<(), RolloutError> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
    records
        .serialize(&mut ser)
        .map_err(|e| RolloutError::Io(e.into()))
}

pub struct RolloutClient {
    client: reqwest::Client,
    cfg: RolloutConfig,
}

impl RolloutClient {
    pub fn new(cfg: RolloutConfig) -> Result<Self, RolloutError> {
        if cfg.concurrency == 0 {
            return Err(RolloutError::InvalidConfig {
                reason: "concurrency must be >= 1".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(RolloutError::Client)?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }

    /// Send one conversation and time the round trip.
    pub async fn complete(
        &self,
        index: usize,
        messages: Vec<ChatMessage>,
    ) -> Result<RolloutRecord, RolloutError> {
        let body = ChatRequest {
            model: &self.cfg.model,
            messages: &messages,
            n: 1,
        };
        let mut req = self.client.post(self.endpoint()).json(&body);
        if !self.cfg.api_key.is_empty() {
            req = req.bearer_auth(&self.cfg.api_key);
        }

        let start = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|source| RolloutError::Request { index, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RolloutError::Status {
                index,
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|source| RolloutError::Request { index, source })?;
        let time = start.elapsed().as_secs_f64();

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(RolloutError::EmptyChoices { index })?;
        Ok(RolloutRecord {
            input: messages,
            output: choice.message.content,
            time,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            total_tokens: parsed.usage.total_tokens,
        })
    }

    /// Run every conversation with bounded concurrency; the first failure aborts.
    pub async fn run(
        &self,
        conversations: Vec<Vec<ChatMessage>>,
    ) -> Result<Vec<RolloutRecord>, RolloutError> {
        let total = conversations.len();
        tracing::info!(
            total,
            concurrency = self.cfg.concurrency,
            url = %self.endpoint(),
            "rollout start"
        );
        let mut pending = stream::iter(conversations.into_iter().enumerate())
            .map(|(index, messages)| async move {
                self.complete(index, messages).await.map(|r| (index, r))
            })
            .buffer_unordered(self.cfg.concurrency);

        let mut done: Vec<(usize, RolloutRecord)> = Vec::with_capacity(total);
        while let Some(item) = pending.next().await {
            done.push(item?);
            if done.len() % 50 == 0 || done.len() == total {
                tracing::info!(done = done.len(), total, "rollout progress");
            }
        }
        done.sort_by_key(|(index, _)| *index);
        Ok(done.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Echoes the user prompt back; longer prompts answer faster so completion
    /// order differs from input order.
    struct Echo;

    impl Respond for Echo {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let prompt = body["messages"][0]["content"].as_str().unwrap().to_string();
            let delay = 60u64.saturating_sub(prompt.len() as u64 * 10);
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(delay))
                .set_body_json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": format!("re:{prompt}") } }],
                    "usage": {
                        "prompt_tokens": prompt.len(),
                        "completion_tokens": 2,
                        "total_tokens": prompt.len() + 2
                    }
                }))
        }
    }

    fn cfg_for(server: &MockServer) -> RolloutConfig {
        RolloutConfig {
            base_url: format!("{}/v1", server.uri()),
            concurrency: 4,
            ..RolloutConfig::default()
        }
    }

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(Echo)
            .mount(&server)
            .await;

        let client = RolloutClient::new(cfg_for(&server)).unwrap();
        let prompts = ["a", "bb", "ccc", "dddd", "eeeee"];
        let convs = prompts.iter().map(|p| vec![ChatMessage::user(*p)]).collect();
        let out = client.run(convs).await.unwrap();

        assert_eq!(out.len(), prompts.len());
        for (rec, p) in out.iter().zip(prompts) {
            assert_eq!(rec.input[0].content, p);
            assert_eq!(rec.output.as_deref(), Some(format!("re:{p}").as_str()));
            assert_eq!(rec.input_tokens, p.len() as u64);
            assert_eq!(rec.total_tokens, p.len() as u64 + 2);
            assert!(rec.time >= 0.0);
        }
    }

    #[tokio::test]
    async fn api_key_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(Echo)
            .expect(1)
            .mount(&server)
            .await;

        let client = RolloutClient::new(RolloutConfig {
            api_key: "sk-test".to_string(),
            ..cfg_for(&server)
        })
        .unwrap();
        let rec = client.complete(0, vec![ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(rec.output.as_deref(), Some("re:hi"));
    }

    #[tokio::test]
    async fn server_error_aborts_with_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = RolloutClient::new(cfg_for(&server)).unwrap();
        let err = client
            .run(vec![vec![ChatMessage::user("x")]])
            .await
            .unwrap_err();
        match err {
            RolloutError::Status {
                index,
                status,
                body,
            } => {
                assert_eq!((index, status), (0, 500));
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = RolloutConfig {
            concurrency: 0,
            ..RolloutConfig::default()
        };
        assert!(matches!(
            RolloutClient::new(cfg),
            Err(RolloutError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn records_need_an_instruction() {
        let recs = vec![json!({"instruction": "sum 1..10"}), json!({"output": "x"})];
        match conversations_from_records(&recs) {
            Err(RolloutError::MissingInstruction { index }) => assert_eq!(index, 1),
            other => panic!("unexpected: {other:?}"),
        }
        let ok = conversations_from_records(&recs[..1]).unwrap();
        assert_eq!(ok, vec![vec![ChatMessage::user("sum 1..10")]]);
    }

    #[test]
    fn output_uses_four_space_indent_and_keeps_unicode() {
        let rec = RolloutRecord {
            input: vec![ChatMessage::user("你好")],
            output: Some("ok".to_string()),
            time: 1.5,
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
        };
        let mut buf = Vec::new();
        write_records(&mut buf, &[rec]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("你好"));
        assert!(text.contains("\n    {\n        \"input\": ["));
    }

    #[tokio::test]
    async fn null_content_and_missing_usage_are_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": null } }]
            })))
            .mount(&server)
            .await;

        let client = RolloutClient::new(cfg_for(&server)).unwrap();
        let rec = client.complete(0, vec![ChatMessage::user("x")]).await.unwrap();
        assert_eq!(rec.output, None);
        assert_eq!(
            (rec.input_tokens, rec.output_tokens, rec.total_tokens),
            (0, 0, 0)
        );
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = RolloutClient::new(cfg_for(&server)).unwrap();
        let err = client
            .run(vec![vec![ChatMessage::user("x")]])
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::EmptyChoices { index: 0 }));
        assert_eq!(err.to_string(), "request 0: response has no choices");
    }
}
