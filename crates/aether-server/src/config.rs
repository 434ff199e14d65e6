// Server configuration
//
// Flags with AETHER_* environment fallbacks. Validation failures are config
// errors and exit with code 1.

use std::path::PathBuf;

use clap::Parser;

/// Which LLM backend the kernel talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// OpenAI or any OpenAI-compatible endpoint
    Openai,
    /// Anthropic messages API
    Anthropic,
    /// Scripted in-process provider; agents complete immediately. For demos
    /// and tests, no network or key required.
    Sim,
}

/// Aether server - an operating system for AI agents
#[derive(Debug, Clone, Parser)]
#[command(name = "aether-server", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "AETHER_LISTEN_ADDR", default_value = "127.0.0.1:7466")]
    pub listen_addr: String,

    /// Directory for the database and sandboxes
    #[arg(long, env = "AETHER_DATA_DIR", default_value = "./aether-data")]
    pub data_dir: PathBuf,

    /// LLM provider backend
    #[arg(long, env = "AETHER_LLM_PROVIDER", value_enum, default_value = "openai")]
    pub llm_provider: ProviderKind,

    /// API key for the LLM provider
    #[arg(long, env = "AETHER_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Base URL override for OpenAI-compatible endpoints
    #[arg(long, env = "AETHER_LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// Default model for spawned agents
    #[arg(long, env = "AETHER_DEFAULT_MODEL", default_value = "gpt-4o")]
    pub default_model: String,

    /// Cheap model used for routing low-stakes goals and summaries
    #[arg(long, env = "AETHER_CHEAP_MODEL", default_value = "gpt-4o-mini")]
    pub cheap_model: String,

    /// Secret for signing session tokens
    #[arg(long, env = "AETHER_JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Password for the bootstrap admin account (generated when unset)
    #[arg(long, env = "AETHER_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,
}

impl Config {
    /// Validate cross-field constraints. Returns a message suitable for a
    /// config-error exit.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("invalid listen address: {}", self.listen_addr));
        }
        match self.llm_provider {
            ProviderKind::Sim => {}
            _ if self.llm_api_key.as_deref().unwrap_or("").is_empty() => {
                return Err("an LLM API key is required (set AETHER_LLM_API_KEY or use --llm-provider sim)".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}
