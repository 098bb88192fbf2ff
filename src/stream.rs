//! The agent CLI's stream-json output protocol, plus the byte-level line
//! scanner that feeds it.

use serde::Deserialize;
use serde_json::Value;

/// Events from the agent CLI's stream-json output format.
///
/// Unknown shapes must be ignored, never fail the stream — use
/// [`decode_line`] rather than `serde_json::from_str` directly.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    /// Incremental text while a content block is still streaming.
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<ContentDelta>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
    },

    /// Terminal event carrying the session-resume token and token usage.
    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        usage: Option<ResultUsage>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    // Content shapes we don't act on (thinking blocks etc.) must not kill
    // the whole message.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ContentDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResultUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
}

/// Decode one complete output line. Returns `None` for anything that is
/// not a recognized protocol event: plain text, malformed JSON, or an
/// unknown `type` tag.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<StreamEvent>(trimmed).ok()
}

/// Extract a short human-readable summary from a tool use event, for
/// broadcast to live observers.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path("file_path")),
        "Write" => format!("Creating: {}", path("file_path")),
        "Edit" => format!("Editing: {}", path("file_path")),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 60))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        _ => name.to_string(),
    }
}

fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut cut = max_len.saturating_sub(3);
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

/// Accumulates raw stdout bytes and yields only complete `\n`-terminated
/// lines. Partial lines — including multi-byte UTF-8 sequences split
/// across read boundaries — stay buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line completed by it. The trailing
    /// `\n` is stripped; the bytes after the last newline remain buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever is buffered once the stream has ended. A final line
    /// without a trailing newline is still a line at EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
