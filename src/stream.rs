use std::path::Path;

use serde_json::Value;

/// Longest text preview shown as a status message, in characters.
const PREVIEW_CHARS: usize = 60;

/// One recognized shape from the NDJSON stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant-role message with its content blocks.
    Assistant(Vec<ContentBlock>),
    /// Bare tool invocation event (not wrapped in an assistant message).
    ToolUse { name: String, input: Value },
    /// Tool output fed back to the model.
    ToolResult,
    /// Terminal result event.
    Result { result: Option<String>, is_error: bool },
    Error { message: String },
    System { subtype: Option<String> },
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Thinking,
    ToolUse { name: String, input: Value },
}

/// Decode a single NDJSON line. Returns `None` when the line is not JSON.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let raw: Value = serde_json::from_str(line.trim()).ok()?;
    Some(classify(&raw))
}

/// Classify an already-decoded JSON value by its `type` field.
pub fn classify(raw: &Value) -> StreamEvent {
    let Some(event_type) = raw.get("type").and_then(Value::as_str) else {
        return StreamEvent::Unrecognized;
    };

    match event_type {
        "assistant" => {
            let msg = raw.get("message").unwrap_or(raw);
            StreamEvent::Assistant(parse_content_blocks(msg.get("content")))
        }
        "thinking" => StreamEvent::Assistant(vec![ContentBlock::Thinking]),
        "text" => match raw.get("text").and_then(Value::as_str) {
            Some(text) => StreamEvent::Assistant(vec![ContentBlock::Text(text.to_string())]),
            None => StreamEvent::Unrecognized,
        },
        "tool_use" => match raw.get("name").and_then(Value::as_str) {
            Some(name) => StreamEvent::ToolUse {
                name: name.to_string(),
                input: raw.get("input").cloned().unwrap_or(Value::Null),
            },
            None => StreamEvent::Unrecognized,
        },
        "user" | "tool_result" => StreamEvent::ToolResult,
        "result" => StreamEvent::Result {
            result: raw.get("result").and_then(Value::as_str).map(String::from),
            is_error: raw
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "error" => {
            let message = raw
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(Value::as_str)
                .or_else(|| raw.get("message").and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
            StreamEvent::Error { message }
        }
        "system" => StreamEvent::System {
            subtype: raw.get("subtype").and_then(Value::as_str).map(String::from),
        },
        _ => StreamEvent::Unrecognized,
    }
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text(text.clone())],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type")?.as_str()? {
                "text" => Some(ContentBlock::Text(block.get("text")?.as_str()?.to_string())),
                "thinking" | "redacted_thinking" => Some(ContentBlock::Thinking),
                "tool_use" | "server_tool_use" => Some(ContentBlock::ToolUse {
                    name: block.get("name")?.as_str()?.to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Splits an arbitrarily chunked byte stream into complete lines.
///
/// The unterminated tail is held back until a later chunk completes it, so
/// the pending tail never contains a newline.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the lines it completed, without their
    /// terminators. Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// The pending incomplete line, decoded lossily.
    pub fn partial(&self) -> String {
        String::from_utf8_lossy(&self.partial).into_owned()
    }
}

/// Turns raw stdout chunks into human-readable progress messages.
#[derive(Debug, Default)]
pub struct StatusTranslator {
    splitter: LineSplitter,
}

impl StatusTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; return the messages for every line it completed.
    /// Lines that are not JSON or not a recognized shape yield nothing.
    pub fn consume(&mut self, chunk: &[u8]) -> Vec<String> {
        self.splitter
            .push(chunk)
            .iter()
            .filter_map(|line| parse_line(line))
            .flat_map(|event| describe(&event))
            .collect()
    }

    pub fn partial_line(&self) -> String {
        self.splitter.partial()
    }
}

/// Status messages for one event, in block order.
pub fn describe(event: &StreamEvent) -> Vec<String> {
    match event {
        StreamEvent::Assistant(blocks) => blocks.iter().filter_map(describe_block).collect(),
        StreamEvent::ToolUse { name, input } => vec![describe_tool(name, input)],
        StreamEvent::Result { .. } => vec!["Finalizing...".to_string()],
        StreamEvent::ToolResult
        | StreamEvent::Error { .. }
        | StreamEvent::System { .. }
        | StreamEvent::Unrecognized => Vec::new(),
    }
}

fn describe_block(block: &ContentBlock) -> Option<String> {
    match block {
        ContentBlock::Text(text) => preview(text),
        ContentBlock::Thinking => Some("Analyzing...".to_string()),
        ContentBlock::ToolUse { name, input } => Some(describe_tool(name, input)),
    }
}

fn describe_tool(name: &str, input: &Value) -> String {
    let arg = |key: &str| {
        input
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    match name {
        "Read" | "NotebookRead" => match arg("file_path").or_else(|| arg("notebook_path")) {
            Some(path) => format!("Reading {}...", basename(path)),
            None => "Reading file...".to_string(),
        },
        "Edit" | "MultiEdit" | "NotebookEdit" => match arg("file_path") {
            Some(path) => format!("Editing {}...", basename(path)),
            None => "Editing file...".to_string(),
        },
        "Write" => match arg("file_path") {
            Some(path) => format!("Writing {}...", basename(path)),
            None => "Writing file...".to_string(),
        },
        "Grep" => match arg("pattern") {
            Some(pattern) => format!("Searching for '{}'...", truncate(pattern)),
            None => "Searching code...".to_string(),
        },
        "Glob" => match arg("pattern") {
            Some(pattern) => format!("Finding files matching {}...", truncate(pattern)),
            None => "Finding files...".to_string(),
        },
        "LS" => match arg("path") {
            Some(path) => format!("Listing {}...", basename(path)),
            None => "Listing files...".to_string(),
        },
        "Bash" => match arg("description") {
            Some(desc) => format!("{}...", truncate(desc.trim_end_matches('.'))),
            None => "Running command...".to_string(),
        },
        "Task" | "Agent" => match arg("description") {
            Some(desc) => format!("Delegating: {}...", truncate(desc.trim_end_matches('.'))),
            None => "Delegating subtask...".to_string(),
        },
        "WebFetch" => match arg("url") {
            Some(url) => format!("Fetching {}...", truncate(url)),
            None => "Fetching page...".to_string(),
        },
        "WebSearch" => match arg("query") {
            Some(query) => format!("Searching the web for '{}'...", truncate(query)),
            None => "Searching the web...".to_string(),
        },
        "TodoWrite" => "Updating checklist...".to_string(),
        other => format!("Using {other}..."),
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Whitespace-collapsed preview of free text; `None` for blank text.
fn preview(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate(&collapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/repo/src/naïve.rs"}}]}}"#,
        "\n",
        "not json at all\n",
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"..."}]}}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the auth module — it builds SQL by hand, which is worth a closer look."},{"type":"tool_use","name":"Grep","input":{"pattern":"execute\\("}}]}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","result":"done"}"#,
        "\n",
    );

    fn expected() -> Vec<String> {
        vec![
            "Analyzing...".to_string(),
            "Reading naïve.rs...".to_string(),
            "Looking at the auth module — it builds SQL by hand, which is...".to_string(),
            "Searching for 'execute\\('...".to_string(),
            "Finalizing...".to_string(),
        ]
    }

    #[test]
    fn test_single_chunk_messages() {
        let mut translator = StatusTranslator::new();
        assert_eq!(translator.consume(PAYLOAD.as_bytes()), expected());
        assert!(translator.partial_line().is_empty());
    }

    #[test]
    fn test_every_two_way_split_matches_single_call() {
        let bytes = PAYLOAD.as_bytes();
        for split in 0..=bytes.len() {
            let mut translator = StatusTranslator::new();
            let mut messages = translator.consume(&bytes[..split]);
            messages.extend(translator.consume(&bytes[split..]));
            assert_eq!(messages, expected(), "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_single_call() {
        let mut translator = StatusTranslator::new();
        let messages: Vec<String> = PAYLOAD
            .as_bytes()
            .iter()
            .flat_map(|b| translator.consume(std::slice::from_ref(b)))
            .collect();
        assert_eq!(messages, expected());
    }

    #[test]
    fn test_uneven_chunks_match_single_call() {
        let bytes = PAYLOAD.as_bytes();
        for size in [3, 7, 13, 64, 101] {
            let mut translator = StatusTranslator::new();
            let messages: Vec<String> = bytes
                .chunks(size)
                .flat_map(|chunk| translator.consume(chunk))
                .collect();
            assert_eq!(messages, expected(), "chunk size {size}");
        }
    }

    #[test]
    fn test_partial_line_held_back() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"{\"type\":").is_empty());
        assert_eq!(splitter.partial(), "{\"type\":");
        let lines = splitter.push(b"\"result\"}\r\n{\"ne");
        assert_eq!(lines, vec![r#"{"type":"result"}"#]);
        assert_eq!(splitter.partial(), "{\"ne");
        assert!(!splitter.partial().contains('\n'));
    }

    #[test]
    fn test_tool_descriptions() {
        let cases = [
            (r#"{"name":"Glob","input":{"pattern":"**/*.rs"}}"#, "Finding files matching **/*.rs..."),
            (r#"{"name":"Bash","input":{"command":"cargo test","description":"Run the test suite."}}"#, "Run the test suite..."),
            (r#"{"name":"Bash","input":{"command":"ls"}}"#, "Running command..."),
            (r#"{"name":"Read","input":{}}"#, "Reading file..."),
            (r#"{"name":"mcp__custom","input":{}}"#, "Using mcp__custom..."),
        ];
        for (json, want) in cases {
            let raw: Value = serde_json::from_str(json).unwrap();
            let name = raw["name"].as_str().unwrap();
            assert_eq!(describe_tool(name, &raw["input"]), want);
        }
    }

    #[test]
    fn test_short_text_not_ellipsized() {
        assert_eq!(preview("  All   good \n"), Some("All good".to_string()));
        assert_eq!(preview("   "), None);
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(parse_line("garbage"), None);
        assert_eq!(parse_line(r#"{"no_type":1}"#), Some(StreamEvent::Unrecognized));
        assert_eq!(
            parse_line(r#"{"type":"future_event","x":1}"#),
            Some(StreamEvent::Unrecognized)
        );
        assert_eq!(
            parse_line(r#"{"type":"error","error":{"message":"overloaded"}}"#),
            Some(StreamEvent::Error {
                message: "overloaded".to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"result","is_error":true}"#),
            Some(StreamEvent::Result {
                result: None,
                is_error: true
            })
        );
        assert!(matches!(
            parse_line(r#"{"type":"tool_use","name":"Read","input":{"file_path":"a/b.rs"}}"#),
            Some(StreamEvent::ToolUse { .. })
        ));
    }

    #[test]
    fn test_unrecognized_lines_produce_nothing() {
        let mut translator = StatusTranslator::new();
        let messages = translator.consume(b"{\"type\":\"system\"}\nplain text\n{\"type\":\"user\"}\n");
        assert!(messages.is_empty());
    }
}
