use crate::process::ProcessConfig;
use crate::review::ReviewRequest;

/// Command-line construction for the analysis executable.
///
/// Always runs non-interactively (`--print`), streams structured NDJSON
/// (`--output-format stream-json`), and caps the session with `--max-turns`.
#[derive(Debug, Clone)]
pub struct AnalysisCommand {
    agent_binary: String,
    model: Option<String>,
    max_turns: u32,
}

impl AnalysisCommand {
    pub fn new(agent_binary: String, model: Option<String>, max_turns: u32) -> Self {
        Self {
            agent_binary,
            model,
            max_turns,
        }
    }

    /// Build the command and arguments for a rendered instruction.
    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.agent_binary.clone(), args)
    }

    /// Full process configuration for one review request.
    pub fn process_config(&self, request: &ReviewRequest, prompt: &str) -> ProcessConfig {
        let (command, args) = self.build_command(prompt);
        ProcessConfig {
            command,
            args,
            working_dir: request.working_dir.clone(),
            log_prefix: format!("review:{}", request.category),
            env: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::review::Category;

    #[test]
    fn test_build_command_defaults() {
        let runner = AnalysisCommand::new("claude".to_string(), None, 30);
        let (cmd, args) = runner.build_command("review this");
        assert_eq!(cmd, "claude");
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"review this".to_string()));
        // No --model when not configured
        assert!(!args.contains(&"--model".to_string()));
    }

    #[test]
    fn test_build_command_turn_budget() {
        let runner = AnalysisCommand::new("claude".to_string(), None, 12);
        let (_cmd, args) = runner.build_command("x");
        let pos = args.iter().position(|a| a == "--max-turns").unwrap();
        assert_eq!(args[pos + 1], "12");
    }

    #[test]
    fn test_build_command_with_model() {
        let runner = AnalysisCommand::new("claude".to_string(), Some("opus".to_string()), 30);
        let (_cmd, args) = runner.build_command("x");
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));
    }

    #[test]
    fn test_prompt_is_last_argument() {
        let runner = AnalysisCommand::new("/usr/local/bin/analyzer".to_string(), None, 30);
        let (cmd, args) = runner.build_command("the prompt");
        assert_eq!(cmd, "/usr/local/bin/analyzer");
        assert_eq!(args.last().map(String::as_str), Some("the prompt"));
    }

    #[test]
    fn test_process_config_uses_request_dir() {
        let runner = AnalysisCommand::new("claude".to_string(), None, 30);
        let request = ReviewRequest {
            task_id: "task-1".to_string(),
            category: Category::Performance,
            working_dir: PathBuf::from("/work/repo"),
            task_description: "speed up".to_string(),
            changed_files: vec![],
        };
        let config = runner.process_config(&request, "p");
        assert_eq!(config.working_dir, PathBuf::from("/work/repo"));
        assert_eq!(config.log_prefix, "review:performance");
    }
}
