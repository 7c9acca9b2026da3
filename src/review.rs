use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Score marker for output that could not be turned into a review result.
/// Never persisted as a completed score.
pub const UNPARSEABLE_SCORE: i32 = -1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Quality,
    Performance,
    Documentation,
    Research,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Security,
        Category::Quality,
        Category::Performance,
        Category::Documentation,
        Category::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Quality => "quality",
            Category::Performance => "performance",
            Category::Documentation => "documentation",
            Category::Research => "research",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown category: {s} (expected: security, quality, performance, documentation, research)"
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Map the severity spellings the analysis tool tends to use. Unknown
    /// values fall back to `Medium`.
    pub fn parse_lenient(raw: &str) -> Severity {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "major" | "error" => Severity::High,
            "low" | "minor" | "info" | "nit" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Finding {
    /// Decode one finding from loosely shaped JSON. Entries carrying neither a
    /// title nor a description are dropped.
    pub fn from_value(value: &Value) -> Option<Finding> {
        let obj = value.as_object()?;
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let title = text("title");
        let description = text("description");
        if title.is_none() && description.is_none() {
            return None;
        }

        let line = match obj.get("line") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        Some(Finding {
            severity: obj
                .get("severity")
                .and_then(Value::as_str)
                .map(Severity::parse_lenient)
                .unwrap_or(Severity::Medium),
            title: title.clone().or_else(|| description.clone()).unwrap_or_default(),
            description: description.or(title).unwrap_or_default(),
            file: text("file"),
            line,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub score: i32,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReviewResult {
    pub fn unparseable() -> Self {
        Self {
            score: UNPARSEABLE_SCORE,
            findings: Vec::new(),
            summary: None,
            error: Some("unparseable".to_string()),
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.score != UNPARSEABLE_SCORE
    }

    /// Build a result from a decoded JSON object. Requires a numeric `score`;
    /// a missing or non-list `findings` becomes an empty list.
    pub fn from_value(value: &Value) -> Option<ReviewResult> {
        let score = value.get("score")?.as_f64()?;
        let findings = value
            .get("findings")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Finding::from_value).collect())
            .unwrap_or_default();
        let summary = value
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Some(ReviewResult {
            score: normalize_score(score),
            findings,
            summary,
            error: None,
        })
    }

    pub fn count_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}

/// Scores are whole numbers in `[0, 100]`: round half away from zero, then clamp.
pub fn normalize_score(raw: f64) -> i32 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as i32
}

/// Everything needed to launch one analysis subprocess.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub task_id: String,
    pub category: Category,
    pub working_dir: PathBuf,
    pub task_description: String,
    pub changed_files: Vec<String>,
}

/// Remove markdown code fences (` ```json ... ``` `) around a payload.
pub fn strip_markdown_fences(input: &str) -> &str {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the optional language tag on the opening fence line
        let Some(pos) = rest.find('\n') else {
            return "";
        };
        let after_tag = &rest[pos + 1..];

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim();
        }
        return after_tag.trim();
    }

    trimmed
}
