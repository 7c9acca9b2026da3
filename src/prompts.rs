use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::extract::{RESULT_CLOSE_TAG, RESULT_OPEN_TAG};
use crate::review::{Category, ReviewRequest};

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");

/// Known template variable names for validation.
const KNOWN_VARIABLES: &[&str] = &[
    "category",
    "checklist",
    "task_description",
    "changed_files",
    "working_dir",
    "result_open_tag",
    "result_close_tag",
];

/// Review checklist embedded in the instruction for each category.
pub fn checklist(category: Category) -> &'static str {
    match category {
        Category::Security => {
            "- Injection (SQL, shell, template) and unsanitized input\n\
             - Authentication and authorization checks on new entry points\n\
             - Secrets, tokens or credentials committed or logged\n\
             - Unsafe deserialization, path traversal, SSRF\n\
             - Dependency changes with known vulnerabilities"
        }
        Category::Quality => {
            "- Correctness of the change against the task description\n\
             - Error handling and edge cases\n\
             - Readability, naming and duplication\n\
             - Test coverage for new behavior\n\
             - Consistency with surrounding code conventions"
        }
        Category::Performance => {
            "- Algorithmic complexity on hot paths\n\
             - Unbounded allocations, copies or collection growth\n\
             - Blocking calls in async or latency-sensitive code\n\
             - N+1 queries and redundant I/O\n\
             - Missing caching or batching where it clearly matters"
        }
        Category::Documentation => {
            "- Public APIs documented and docs match behavior\n\
             - README or usage docs updated for user-facing changes\n\
             - Comments explain constraints, not restate code\n\
             - Changelog or migration notes where needed"
        }
        Category::Research => {
            "- Whether the approach fits established patterns in this codebase\n\
             - Existing utilities or libraries that already solve the problem\n\
             - Risks, open questions and alternatives worth considering\n\
             - Follow-up work the change implies"
        }
    }
}

fn template_filename(category: Category) -> String {
    format!("{category}-review.md")
}

/// Instruction template engine with an embedded default and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load the instruction template for a category.
    ///
    /// Lookup order in `override_dir`: `<category>-review.md`, then
    /// `review.md`; otherwise the embedded default.
    pub fn load_template(&self, category: Category) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            for name in [template_filename(category), "review.md".to_string()] {
                let path = Path::new(dir).join(name);
                if path.exists() {
                    return std::fs::read_to_string(&path).map_err(|e| {
                        Error::Prompt(format!(
                            "failed to read override template {}: {e}",
                            path.display()
                        ))
                    });
                }
            }
        }

        Ok(DEFAULT_REVIEW.to_string())
    }

    /// Render the full instruction for one review request.
    pub fn render_review(&self, request: &ReviewRequest) -> Result<String> {
        let template = self.load_template(request.category)?;
        render_template(&template, &review_vars(request))
    }
}

fn review_vars(request: &ReviewRequest) -> HashMap<String, String> {
    let changed_files = if request.changed_files.is_empty() {
        "(not provided; inspect the working tree)".to_string()
    } else {
        request
            .changed_files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    HashMap::from([
        ("category".to_string(), request.category.to_string()),
        ("checklist".to_string(), checklist(request.category).to_string()),
        (
            "task_description".to_string(),
            request.task_description.clone(),
        ),
        ("changed_files".to_string(), changed_files),
        (
            "working_dir".to_string(),
            request.working_dir.display().to_string(),
        ),
        ("result_open_tag".to_string(), RESULT_OPEN_TAG.to_string()),
        ("result_close_tag".to_string(), RESULT_CLOSE_TAG.to_string()),
    ])
}

/// Render a template string by substituting `{{variable}}` placeholders.
/// Errors on unknown variables (strict mode).
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next(); // consume second {
            let mut var_name = String::new();
            let mut found_close = false;

            while let Some(c2) = chars.next() {
                if c2 == '}' && chars.peek() == Some(&'}') {
                    chars.next(); // consume second }
                    found_close = true;
                    break;
                }
                var_name.push(c2);
            }

            if !found_close {
                return Err(Error::Prompt(format!(
                    "unclosed template variable: {{{{{var_name}"
                )));
            }

            let var_name = var_name.trim();
            if !KNOWN_VARIABLES.contains(&var_name) {
                return Err(Error::Prompt(format!(
                    "unknown template variable: {var_name}"
                )));
            }

            match vars.get(var_name) {
                Some(value) => result.push_str(value),
                None => {
                    return Err(Error::Prompt(format!(
                        "missing value for template variable: {var_name}"
                    )));
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}
