use crate::agent::AgentLoopConfig;
use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding project and user configuration
pub const CONFIG_DIR: &str = ".textbridge";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// `[model]`: the OpenAI-compatible endpoint
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Resolve the API key from config or environment. Local servers often
    /// need none, so a missing key is not an error.
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        // Direct key takes priority
        if let Some(key) = &self.api_key {
            return Some(SecretString::from(key.clone()));
        }
        let env_var = self.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV);
        std::env::var(env_var).ok().map(SecretString::from)
    }
}

/// `[agent]`: loop limits
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub empty_response_limit: Option<u32>,
    #[serde(default)]
    pub warmup: Option<bool>,
}

impl AgentConfig {
    pub fn loop_config(&self) -> AgentLoopConfig {
        let mut config = AgentLoopConfig::default();
        if let Some(n) = self.max_iterations {
            config = config.with_max_iterations(n);
        }
        if let Some(n) = self.empty_response_limit {
            config = config.with_empty_response_limit(n);
        }
        if self.warmup == Some(false) {
            config = config.without_warmup();
        }
        config
    }
}

/// `[compile]`: the compiler oracle command lines
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompileConfig {
    /// Build command, e.g. `npm run build`. No command means every compile passes.
    #[serde(default)]
    pub command: Option<String>,
    /// Type-check command run before the build unless skipped
    #[serde(default)]
    pub check_command: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CompileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_COMPILE_TIMEOUT_MS))
    }
}

/// `[log]`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
}

impl LogConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Config files in merge order: user, project, local
    pub fn layer_paths(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_DIR).join("config.toml"));
        }
        let project = project_dir.join(CONFIG_DIR);
        paths.push(project.join("config.toml"));
        // Should be gitignored
        paths.push(project.join("config.local.toml"));
        paths
    }

    /// Load configuration for `project_dir`.
    /// Priority: local (.textbridge/config.local.toml) > project
    /// (.textbridge/config.toml) > user (~/.textbridge/config.toml) > defaults
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::default();
        for path in Self::layer_paths(project_dir) {
            if path.exists() {
                config.merge(Self::load_from(&path)?);
            }
        }
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Merge another config into this one (other takes priority for every
    /// value it sets)
    pub fn merge(&mut self, other: Config) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.model.base_url, other.model.base_url);
        take(&mut self.model.model, other.model.model);
        take(&mut self.model.api_key_env, other.model.api_key_env);
        take(&mut self.model.api_key, other.model.api_key);
        take(&mut self.model.temperature, other.model.temperature);
        take(&mut self.model.max_tokens, other.model.max_tokens);

        take(&mut self.agent.max_iterations, other.agent.max_iterations);
        take(
            &mut self.agent.empty_response_limit,
            other.agent.empty_response_limit,
        );
        take(&mut self.agent.warmup, other.agent.warmup);

        take(&mut self.compile.command, other.compile.command);
        take(&mut self.compile.check_command, other.compile.check_command);
        take(&mut self.compile.timeout_ms, other.compile.timeout_ms);

        take(&mut self.log.level, other.log.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.model.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.model.model(), DEFAULT_MODEL);
        assert_eq!(config.compile.timeout(), Duration::from_millis(120_000));
        assert_eq!(config.log.level(), "warn");
        let loop_config = config.agent.loop_config();
        assert_eq!(loop_config.max_iterations, 20);
        assert_eq!(loop_config.empty_response_limit, 3);
    }

    #[test]
    fn test_later_layers_override() {
        let mut config = Config::parse(
            r#"
            [model]
            model = "gpt-4o"
            temperature = 0.2

            [agent]
            max_iterations = 8
            "#,
        )
        .unwrap();
        config.merge(
            Config::parse(
                r#"
                [model]
                model = "qwen2.5-coder"
                base_url = "http://localhost:11434/v1"

                [compile]
                command = "npm run build"
                "#,
            )
            .unwrap(),
        );

        assert_eq!(config.model.model(), "qwen2.5-coder");
        assert_eq!(config.model.base_url(), "http://localhost:11434/v1");
        assert_eq!(config.model.temperature, Some(0.2));
        assert_eq!(config.agent.loop_config().max_iterations, 8);
        assert_eq!(config.compile.command.as_deref(), Some("npm run build"));
    }

    #[test]
    fn test_load_project_layers() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[log]\nlevel = \"info\"\n[agent]\nwarmup = false\n",
        )
        .unwrap();
        std::fs::write(config_dir.join("config.local.toml"), "[log]\nlevel = \"debug\"\n").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.log.level(), "debug");
        assert!(!config.agent.loop_config().warmup);
    }

    #[test]
    fn test_invalid_config_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nmax_iterations = \"many\"\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid config"));
    }

    #[test]
    fn test_direct_api_key_wins() {
        let config = Config::parse("[model]\napi_key = \"sk-test\"\n").unwrap();
        let key = config.model.resolve_api_key().unwrap();
        assert_eq!(key.expose_secret(), "sk-test");
    }
}
