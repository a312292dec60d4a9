//! Run configuration.
//!
//! A run is described by one YAML file. Every section has defaults, so an
//! empty file is a valid (if not very useful) configuration. API keys are
//! never stored in the file; sections name the environment variable that
//! holds them instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dataset::DatasetFields;
use crate::error::ConfigError;
use crate::sampler::SamplingPolicy;
use crate::scaffold::AgentConfig;
use crate::scheduler::SchedulerConfig;

/// Agent model endpoint plus loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// OpenAI-compatible base URL (LiteLLM proxy, OpenRouter, vLLM, ...).
    pub api_base: String,
    /// Environment variable holding the API key; unset means no auth.
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
    #[serde(flatten)]
    pub settings: AgentConfig,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:4000/v1".to_string(),
            api_key_env: Some("LITELLM_API_KEY".to_string()),
            request_timeout_secs: 300,
            settings: AgentConfig::default().with_model("gpt-4o-mini"),
        }
    }
}

/// One remote tool exposed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// JSON schema of the arguments object.
    #[serde(default = "default_tool_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_tool_parameters() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    F1,
    #[default]
    LlmJudge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierSection {
    pub kind: VerifierKind,
    /// F1 at or above this counts as correct without asking the grader.
    pub f1_threshold: f64,
    /// Grader model; falls back to the agent model.
    pub grader_model: Option<String>,
    /// Grader endpoint; falls back to the agent endpoint.
    pub grader_api_base: Option<String>,
    pub grader_api_key_env: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            kind: VerifierKind::default(),
            f1_threshold: 0.9,
            grader_model: None,
            grader_api_base: None,
            grader_api_key_env: None,
            temperature: 0.3,
            max_tokens: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    /// SQLite file shared by every shard on this machine.
    pub path: PathBuf,
    pub memory_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./cache/tool_cache.db"),
            memory_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    #[serde(flatten)]
    pub core: SchedulerConfig,
    pub progress_interval_secs: u64,
    /// Warn when nothing settles for this long.
    pub stall_after_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            core: SchedulerConfig::default(),
            progress_interval_secs: 30,
            stall_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root of attempt logs and batch snapshots.
    pub root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./runs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatasetSection {
    /// Dataset name; keys storage and prefixes fallback item ids.
    pub name: Option<String>,
    /// JSONL file to load.
    pub path: Option<PathBuf>,
    pub max_examples: Option<usize>,
    #[serde(flatten)]
    pub fields: DatasetFields,
}

/// Full configuration of a `generate` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunConfig {
    pub agent: AgentSection,
    pub tools: Vec<ToolSpec>,
    pub verifier: VerifierSection,
    pub cache: CacheSection,
    pub sampling: SamplingPolicy,
    pub scheduler: SchedulerSection,
    pub storage: StorageSection,
    pub dataset: DatasetSection,
}

impl RunConfig {
    /// Loads and validates a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.settings.model.trim().is_empty() {
            return Err(invalid("agent.model", "cannot be empty"));
        }
        if self.agent.settings.max_turns == 0 {
            return Err(invalid("agent.max_turns", "must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.agent.settings.temperature) {
            return Err(invalid("agent.temperature", "must be within [0, 2]"));
        }
        if self.agent.request_timeout_secs == 0 {
            return Err(invalid("agent.request_timeout_secs", "must be greater than 0"));
        }

        let mut names = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(invalid("tools.name", "cannot be empty"));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(invalid("tools.name", &format!("duplicate tool '{}'", tool.name)));
            }
            if !(tool.endpoint.starts_with("http://") || tool.endpoint.starts_with("https://")) {
                return Err(invalid(
                    "tools.endpoint",
                    &format!("'{}' is not an http(s) URL", tool.endpoint),
                ));
            }
            if tool.timeout_secs == 0 {
                return Err(invalid("tools.timeout_secs", "must be greater than 0"));
            }
        }

        if !(0.0..=1.0).contains(&self.verifier.f1_threshold) {
            return Err(invalid("verifier.f1_threshold", "must be within [0, 1]"));
        }

        self.sampling.validate()?;
        self.scheduler
            .core
            .validate()
            .map_err(|e| invalid("scheduler", &e.to_string()))?;
        if self.scheduler.progress_interval_secs == 0 {
            return Err(invalid("scheduler.progress_interval_secs", "must be greater than 0"));
        }

        if self.cache.enabled && self.cache.path.as_os_str().is_empty() {
            return Err(invalid("cache.path", "cannot be empty when the cache is enabled"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Commented example printed by `traceforge example-config`.
pub const EXAMPLE_CONFIG: &str = r#"# traceforge run configuration

agent:
  api_base: http://localhost:4000/v1
  api_key_env: LITELLM_API_KEY
  model: gpt-4o-mini
  max_turns: 16
  temperature: 0.2
  max_tokens: 4096
  # ask once for an answer when the turn limit is hit
  force_final_answer: true

tools:
  - name: web_search
    description: Search the web. Returns titles, URLs and snippets.
    endpoint: http://localhost:8000/tools/web_search
    timeout_secs: 30
    parameters:
      type: object
      properties:
        query: { type: string }
      required: [query]
  - name: fetch_page
    description: Fetch a web page and return its main text.
    endpoint: http://localhost:8000/tools/fetch_page
    timeout_secs: 60
    parameters:
      type: object
      properties:
        url: { type: string }
      required: [url]

verifier:
  kind: llm_judge        # or f1
  f1_threshold: 0.9
  grader_model: gpt-4o-mini

cache:
  enabled: true
  path: ./cache/tool_cache.db
  memory_entries: 10000

sampling:
  max_attempts: 5
  threshold: 1.0

scheduler:
  max_concurrent: 8
  batch_size: 64
  resume_from_cache: true
  progress_interval_secs: 30
  stall_after_secs: 900

storage:
  root: ./runs

dataset:
  name: trivia
  path: ./data/trivia.jsonl
  id_field: id
  prompt_field: question
  answer_field: answer
"#;
