use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    /// Native tool calling unless the model is known to lack it.
    #[default]
    Auto,
    Native,
    Text,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Backend used by the code sandbox; falls back to `provider`/`model`.
    #[serde(default)]
    pub code_provider: Option<String>,
    #[serde(default)]
    pub code_model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Inline key. Prefer the provider's environment variable.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_code_max_tokens")]
    pub code_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_code_temperature")]
    pub code_temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub tool_protocol: ToolProtocol,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_deliverable")]
    pub deliverable: String,
    #[serde(default = "default_journal")]
    pub journal: String,
    #[serde(default = "default_plan_snapshot")]
    pub plan_snapshot: String,
    /// Directory holding `<agent_type>.md` persona overrides.
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_max_decisions")]
    pub max_decisions: usize,
    #[serde(default = "default_decision_attempts")]
    pub decision_attempts: usize,
    #[serde(default = "default_refinement_iterations")]
    pub refinement_iterations: usize,
    #[serde(default = "default_agent_max_iterations")]
    pub agent_max_iterations: usize,
}

fn default_provider() -> String {
    "siliconflow".to_string()
}
fn default_model() -> String {
    "deepseek-ai/DeepSeek-V3.1-Terminus".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_code_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}
fn default_code_temperature() -> f32 {
    0.2
}
fn default_request_timeout() -> u64 {
    120
}
fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspaces")
}
fn default_deliverable() -> String {
    "final_report.md".to_string()
}
fn default_journal() -> String {
    "main_journal.md".to_string()
}
fn default_plan_snapshot() -> String {
    "plan.json".to_string()
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_sandbox_timeout() -> u64 {
    300
}
fn default_max_attempts() -> usize {
    10
}
fn default_max_decisions() -> usize {
    40
}
fn default_decision_attempts() -> usize {
    3
}
fn default_refinement_iterations() -> usize {
    3
}
fn default_agent_max_iterations() -> usize {
    10
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            code_provider: None,
            code_model: None,
            base_url: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            code_max_tokens: default_code_max_tokens(),
            temperature: default_temperature(),
            code_temperature: default_code_temperature(),
            request_timeout_secs: default_request_timeout(),
            tool_protocol: ToolProtocol::Auto,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            deliverable: default_deliverable(),
            journal: default_journal(),
            plan_snapshot: default_plan_snapshot(),
            prompts_dir: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_sandbox_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_decisions: default_max_decisions(),
            decision_attempts: default_decision_attempts(),
            refinement_iterations: default_refinement_iterations(),
            agent_max_iterations: default_agent_max_iterations(),
        }
    }
}

impl LlmConfig {
    pub fn code_provider(&self) -> &str {
        self.code_provider.as_deref().unwrap_or(&self.provider)
    }

    pub fn code_model(&self) -> &str {
        self.code_model.as_deref().unwrap_or(&self.model)
    }
}

impl AppConfig {
    /// `$XDG_CONFIG_HOME/agentflow/config.toml`, or `./agentflow.toml` when no
    /// config directory is known.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("agentflow").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("agentflow.toml"))
    }

    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("AGENTFLOW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default_path()),
        };

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let parsed: AppConfig = toml::from_str(&content)?;
            info!("Loaded configuration from {:?}", config_path);
            parsed
        } else {
            if path.is_some() {
                bail!("Config file not found: {}", config_path.display());
            }
            info!("No config file at {:?}, using defaults.", config_path);
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENTFLOW_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = lookup("AGENTFLOW_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("AGENTFLOW_CODE_MODEL") {
            self.llm.code_model = Some(v);
        }
        if let Some(v) = lookup("AGENTFLOW_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTFLOW_SANDBOX_PYTHON") {
            self.sandbox.interpreter = v;
        }
        if let Some(v) = lookup("AGENTFLOW_SANDBOX_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.sandbox.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.max_attempts == 0 {
            bail!("sandbox.max_attempts must be at least 1");
        }
        if self.sandbox.timeout_secs == 0 {
            bail!("sandbox.timeout_secs must be at least 1");
        }
        if self.orchestration.max_decisions == 0 {
            bail!("orchestration.max_decisions must be at least 1");
        }
        if self.orchestration.decision_attempts == 0 {
            bail!("orchestration.decision_attempts must be at least 1");
        }
        if self.orchestration.agent_max_iterations == 0 {
            bail!("orchestration.agent_max_iterations must be at least 1");
        }
        if self.workspace.deliverable.trim().is_empty() {
            bail!("workspace.deliverable must name a file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.sandbox.max_attempts, 10);
        assert_eq!(cfg.orchestration.max_decisions, 40);
        assert_eq!(cfg.orchestration.decision_attempts, 3);
        assert_eq!(cfg.workspace.deliverable, "final_report.md");
        assert_eq!(cfg.llm.tool_protocol, ToolProtocol::Auto);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [llm]
            provider = "openai"
            model = "gpt-4o"
            tool_protocol = "text"

            [sandbox]
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm.tool_protocol, ToolProtocol::Text);
        assert_eq!(cfg.llm.code_model(), "gpt-4o");
        assert_eq!(cfg.sandbox.max_attempts, 4);
        assert_eq!(cfg.sandbox.timeout_secs, 300);
    }

    #[test]
    fn zero_budgets_are_rejected() {
        assert!(AppConfig::from_toml_str("[sandbox]\nmax_attempts = 0").is_err());
        assert!(AppConfig::from_toml_str("[orchestration]\nmax_decisions = 0").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "AGENTFLOW_MODEL" => Some("m2".to_string()),
            "AGENTFLOW_SANDBOX_TIMEOUT" => Some("42".to_string()),
            "AGENTFLOW_WORKSPACE_ROOT" => Some("/tmp/ws".to_string()),
            _ => None,
        });
        assert_eq!(cfg.llm.model, "m2");
        assert_eq!(cfg.sandbox.timeout_secs, 42);
        assert_eq!(cfg.workspace.root, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn invalid_timeout_override_is_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|key| {
            (key == "AGENTFLOW_SANDBOX_TIMEOUT").then(|| "soon".to_string())
        });
        assert_eq!(cfg.sandbox.timeout_secs, 300);
    }
}
