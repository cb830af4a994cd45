use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub agent: AgentConfig,
    pub browser: BrowserConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAIConfig>,
    pub default_provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on model turns per task before the run is failed.
    pub max_turns: usize,
    /// Number of most recent assistant turns kept verbatim when pruning.
    pub history_window: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Command used to launch the browser automation server.
    pub command: String,
    pub args: Vec<String>,
    /// Directory where captured screenshots are persisted.
    pub output_dir: String,
    pub request_timeout_seconds: u64,
    /// Tool names never exposed to the model.
    pub blocked_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum simultaneously open tabs. 0 = unlimited.
    pub max_pages: usize,
    /// Restart the browser session after this many page creations. 0 = never.
    pub restart_after_pages: usize,
    /// Close inactive tabs idle longer than this. 0 = disabled.
    pub idle_tab_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 60,
            history_window: 8,
            max_retry_attempts: 5,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@playwright/mcp@latest".to_string()],
            output_dir: "output".to_string(),
            request_timeout_seconds: 60,
            blocked_tools: vec!["browser_evaluate".to_string()],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pages: 4,
            restart_after_pages: 0,
            idle_tab_timeout_seconds: 300,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: ProvidersConfig {
                anthropic: Some(AnthropicConfig {
                    api_key: String::new(),
                    model: "claude-3-5-sonnet-20241022".to_string(),
                    max_tokens: Some(4096),
                    temperature: Some(0.1),
                }),
                openai: None,
                default_provider: "anthropic".to_string(),
            },
            agent: AgentConfig::default(),
            browser: BrowserConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Check if any config file exists
        let config_exists = if let Some(path) = config_path {
            Path::new(path).exists()
        } else {
            Self::default_paths().iter().any(|path| {
                let expanded = shellexpand::tilde(path);
                Path::new(expanded.as_ref()).exists()
            })
        };

        // If no config exists, create and save a default config
        if !config_exists {
            let default_config = Self::default();

            let config_dir = dirs::home_dir()
                .map(|mut path| {
                    path.push(".config");
                    path.push("webpilot");
                    path
                })
                .unwrap_or_else(|| std::path::PathBuf::from("."));

            std::fs::create_dir_all(&config_dir).ok();

            let config_file = config_dir.join("config.toml");
            if let Some(path) = config_file.to_str() {
                if let Err(e) = default_config.save(path) {
                    eprintln!("Warning: Could not save default config: {}", e);
                }
            }

            return Ok(default_config);
        }

        let mut settings = config::Config::builder();

        // Load default configuration
        settings = settings.add_source(config::Config::try_from(&Config::default())?);

        // Load from config file if provided
        if let Some(path) = config_path {
            if Path::new(path).exists() {
                settings = settings.add_source(config::File::with_name(path));
            }
        } else {
            for path in Self::default_paths() {
                let expanded = shellexpand::tilde(path);
                if Path::new(expanded.as_ref()).exists() {
                    settings = settings.add_source(config::File::with_name(expanded.as_ref()));
                    break;
                }
            }
        }

        // Override with environment variables
        settings = settings.add_source(config::Environment::with_prefix("WEBPILOT").separator("_"));

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    fn default_paths() -> &'static [&'static str] {
        &[
            "./webpilot.toml",
            "~/.config/webpilot/config.toml",
            "~/.webpilot.toml",
        ]
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn load_with_overrides(
        config_path: Option<&str>,
        provider_override: Option<String>,
        model_override: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(provider) = provider_override {
            config.providers.default_provider = provider;
        }

        if let Some(model) = model_override {
            match config.providers.default_provider.as_str() {
                "anthropic" => {
                    if let Some(ref mut anthropic) = config.providers.anthropic {
                        anthropic.model = model;
                    } else {
                        return Err(anyhow::anyhow!(
                            "Provider 'anthropic' is not configured. Please add anthropic configuration to your config file."
                        ));
                    }
                }
                "openai" => {
                    if let Some(ref mut openai) = config.providers.openai {
                        openai.model = model;
                    } else {
                        return Err(anyhow::anyhow!(
                            "Provider 'openai' is not configured. Please add openai configuration to your config file."
                        ));
                    }
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "Unknown provider: {}",
                        config.providers.default_provider
                    ))
                }
            }
        }

        Ok(config)
    }
}
