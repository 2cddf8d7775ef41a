//! Stream Decoder (§4.1): parses the worker subprocess's line-delimited JSON
//! into typed events, tolerating malformed lines.
use serde::Deserialize;

/// One block of an assistant message's `content` array (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

/// A decoded line from the worker's stdout (§6).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Assistant(AssistantMessage),
    Result {
        is_error: bool,
        session_id: Option<String>,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    /// `type` is something other than `assistant`/`result` (e.g. `system`,
    /// `human`) — opaque, logged, otherwise ignored.
    Unknown(serde_json::Value),
    /// The line did not parse as JSON at all. Captured as raw output but
    /// never drives a state transition.
    RawText(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLine {
    Assistant { message: AssistantMessage },
    Result {
        is_error: bool,
        session_id: Option<String>,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    #[serde(other)]
    Other,
}

/// Incremental line-buffering decoder. One instance per worker stream; not
/// shared across streams.
#[derive(Default)]
pub struct StreamDecoder {
    buf: String,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder { buf: String::new() }
    }

    /// Feed a chunk of bytes (assumed UTF-8; invalid bytes are replaced).
    /// Returns events for every complete line seen so far; a trailing
    /// partial line is buffered until the next `feed` or `flush`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].to_string();
            self.buf.drain(..=pos);
            if let Some(ev) = Self::decode_line(&line) {
                events.push(ev);
            }
        }
        events
    }

    /// End-of-stream: decode and clear any buffered partial line.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        Self::decode_line(&line)
    }

    fn decode_line(line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<RawLine>(line) {
            Ok(RawLine::Assistant { message }) => Some(StreamEvent::Assistant(message)),
            Ok(RawLine::Result {
                is_error,
                session_id,
                total_cost_usd,
                duration_ms,
            }) => Some(StreamEvent::Result {
                is_error,
                session_id,
                total_cost_usd,
                duration_ms,
            }),
            Ok(RawLine::Other) => {
                let value = serde_json::from_str(line).unwrap_or(serde_json::Value::Null);
                Some(StreamEvent::Unknown(value))
            }
            Err(_) => Some(StreamEvent::RawText(line.to_string())),
        }
    }
}

/// Aggregate the text content of an assistant message.
fn assistant_text(msg: &AssistantMessage) -> String {
    msg.content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Aggregated text of an event that carries any (assistant text, raw line).
/// Used by the scheduler's quality-gate completion detectors, which check
/// for banners beyond the review pass/fail pair handled by `review_complete`.
pub fn text_of(event: &StreamEvent) -> Option<String> {
    match event {
        StreamEvent::Assistant(msg) => Some(assistant_text(msg)),
        StreamEvent::RawText(t) => Some(t.clone()),
        _ => None,
    }
}

/// Any content block is a tool-use block (§4.1).
pub fn has_tool_use(msg: &AssistantMessage) -> bool {
    msg.content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
}

/// Longest first case-insensitive PR URL match in aggregated text (§4.1).
pub fn extract_pr_url(msg: &AssistantMessage) -> Option<String> {
    extract_pr_url_from_text(&assistant_text(msg))
}

fn extract_pr_url_from_text(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let needle = "/pull/";
    let mut best: Option<&str> = None;
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find(needle) {
        let idx = search_from + rel;
        // Walk backward to the start of the URL (a run of non-whitespace).
        let start = text[..idx]
            .rfind(|c: char| c.is_whitespace())
            .map(|p| p + 1)
            .unwrap_or(0);
        let tail_start = idx + needle.len();
        let digits_end = text[tail_start..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|p| tail_start + p)
            .unwrap_or(text.len());
        if digits_end > tail_start {
            let candidate = &text[start..digits_end];
            if candidate.to_lowercase().starts_with("https://") {
                if best.map(|b| candidate.len() > b.len()).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }
        search_from = idx + needle.len();
    }
    best.map(|s| s.to_string())
}

/// Numeric suffix of a PR URL (§4.1).
pub fn extract_pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

/// `result.is_error`, or API-error text patterns. Build/test failures do
/// NOT match (§4.1).
pub fn is_api_error(event: &StreamEvent) -> bool {
    match event {
        StreamEvent::Result { is_error, .. } => *is_error,
        StreamEvent::Assistant(msg) => {
            let lower = assistant_text(msg).to_lowercase();
            (lower.contains("api") && lower.contains("error"))
                || (lower.contains("rate") && lower.contains("limit"))
                || lower.contains("econnrefused")
                || (lower.contains("connection") && lower.contains("failed"))
        }
        _ => false,
    }
}

/// `result`, or assistant message with `stop_reason = end_turn` (§4.1).
pub fn is_complete(event: &StreamEvent) -> bool {
    match event {
        StreamEvent::Result { .. } => true,
        StreamEvent::Assistant(msg) => msg.stop_reason.as_deref() == Some("end_turn"),
        _ => false,
    }
}

/// Outcome of a review completion banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Passed,
    Failed,
    None,
}

/// "RESULT: PASS" (including "CONDITIONAL PASS") or "RESULT: FAIL" banner,
/// case-insensitive (§4.1).
pub fn review_complete(event: &StreamEvent) -> ReviewOutcome {
    let text = match event {
        StreamEvent::Assistant(msg) => assistant_text(msg),
        StreamEvent::RawText(t) => t.clone(),
        _ => return ReviewOutcome::None,
    };
    let lower = text.to_lowercase();
    if lower.contains("result: pass") || lower.contains("result: conditional pass") {
        ReviewOutcome::Passed
    } else if lower.contains("result: fail") {
        ReviewOutcome::Failed
    } else {
        ReviewOutcome::None
    }
}
