#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const OPEN_TAG: &str = "<review_result>";
pub const CLOSE_TAG: &str = "</review_result>";

/// Write an executable bash script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// One NDJSON assistant line carrying a tagged review result.
pub fn result_line(score: i64, findings: serde_json::Value) -> String {
    let payload = serde_json::json!({
        "score": score,
        "summary": format!("mock review scored {score}"),
        "findings": findings,
    });
    let text = format!("Review done.\n{OPEN_TAG}{payload}{CLOSE_TAG}");
    serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": text}]}
    })
    .to_string()
}

pub fn one_finding() -> serde_json::Value {
    serde_json::json!([{
        "severity": "high",
        "title": "Unchecked input",
        "description": "Request body is used without validation in {handler}",
        "file": "src/api.rs",
        "line": 12
    }])
}

/// Script body that streams a tool call and a result, then exits cleanly.
pub fn analyzer_body(score: i64) -> String {
    let tool = serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "name": "Read", "input": {"file_path": "src/api.rs"}}]}
    });
    let result = result_line(score, one_finding());
    format!("cat <<'NDJSON'\n{tool}\n{result}\nNDJSON\n")
}
