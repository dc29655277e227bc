// agent-chat/crates/agent-chat/src/config.rs

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

use crate::agent::MultiToolPolicy;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. You may call tools to gather \
information, but you must call at most one tool per turn. Use the reasoning tool to plan \
multi-step work and set ready_to_reply to true once you have enough evidence for a final answer.";

const DEFAULT_MULTIPLE_TOOLS_WARNING: &str = "You requested several tools in one turn. Only one \
tool call is allowed per turn. Pick the single most important tool call and try again.";

const DEFAULT_SELF_CHECK_PROMPT: &str = "Before replying, check that the final answer addresses \
every part of the user's request and cites the tool results it relies on.";

/// A chat model the frontend may select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub supports_vision: bool,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub registration_token: String,
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub system_prompt: String,
    pub multiple_tools_warning: String,
    pub self_check_prompt: String,
    pub max_iterations: u32,
    pub max_retries: u32,
    pub max_transport_retries: u32,
    pub multi_tool_policy: MultiToolPolicy,
    pub default_timezone: String,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub base_url: String,
    pub default_category: String,
    pub default_backend: String,
    pub default_region: String,
    pub default_safesearch: String,
    pub default_timelimit: Option<String>,
    pub timeout_seconds: u64,
    pub verify_ssl: bool,
    pub proxy: Option<String>,
    pub max_results: u32,
    pub cache_ttl_seconds: u64,
    pub cache_maxsize: u64,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub max_file_size: usize,
    pub image_quality: u8,
    pub image_max_dimension: u32,
    pub libreoffice_path: String,
    pub libreoffice_timeout_seconds: u64,
    pub pdftoppm_path: String,
    pub pdf_dpi: u32,
    pub workers: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub models: Vec<ModelInfo>,
    pub auth: AuthSettings,
    pub llm: LlmSettings,
    pub agent: AgentSettings,
    pub search: SearchSettings,
    pub conversion: ConversionSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let jwt_secret = env::var("JWT_SECRET_KEY")
            .context("JWT_SECRET_KEY environment variable not set. Please set it in your .env file")?;
        if jwt_secret.trim().is_empty() {
            return Err(anyhow!("JWT_SECRET_KEY must not be empty"));
        }

        let models = parse_models(
            &env::var("AVAILABLE_MODELS").unwrap_or_else(|_| "gpt-4o-mini:GPT-4o mini:vision".into()),
        )?;
        if models.is_empty() {
            return Err(anyhow!("AVAILABLE_MODELS must list at least one model"));
        }

        let default_workers = num_cpus::get().clamp(1, 8);

        Ok(Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env::var("API_PORT").unwrap_or_else(|_| "8000".into()).parse()?,
            database_path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/app.db".into()),
            ),
            models,
            auth: AuthSettings {
                registration_token: env::var("REGISTRATION_TOKEN").unwrap_or_default(),
                jwt_secret,
                access_token_expire_minutes: env::var("ACCESS_TOKEN_EXPIRE_MINUTES")
                    .unwrap_or_else(|_| "30".into())
                    .parse()?,
                refresh_token_expire_days: env::var("REFRESH_TOKEN_EXPIRE_DAYS")
                    .unwrap_or_else(|_| "7".into())
                    .parse()?,
            },
            llm: LlmSettings {
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8080/v1".into())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                temperature: env::var("LLM_TEMPERATURE").unwrap_or_else(|_| "0.5".into()).parse()?,
                top_p: env::var("LLM_TOP_P").unwrap_or_else(|_| "1.0".into()).parse()?,
                max_tokens: parse_optional("LLM_MAX_TOKENS")?,
                frequency_penalty: env::var("LLM_FREQUENCY_PENALTY")
                    .unwrap_or_else(|_| "0.0".into())
                    .parse()?,
                presence_penalty: env::var("LLM_PRESENCE_PENALTY")
                    .unwrap_or_else(|_| "0.0".into())
                    .parse()?,
                request_timeout_seconds: env::var("LLM_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "600".into())
                    .parse()?,
            },
            agent: AgentSettings {
                system_prompt: env::var("SYSTEM_PROMPT")
                    .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.into()),
                multiple_tools_warning: env::var("MULTIPLE_TOOLS_WARNING")
                    .unwrap_or_else(|_| DEFAULT_MULTIPLE_TOOLS_WARNING.into()),
                self_check_prompt: env::var("SELF_CHECK_PROMPT")
                    .unwrap_or_else(|_| DEFAULT_SELF_CHECK_PROMPT.into()),
                max_iterations: env::var("AGENT_MAX_ITERATIONS")
                    .unwrap_or_else(|_| "50".into())
                    .parse()?,
                max_retries: env::var("AGENT_MAX_RETRIES").unwrap_or_else(|_| "3".into()).parse()?,
                max_transport_retries: env::var("AGENT_MAX_TRANSPORT_RETRIES")
                    .unwrap_or_else(|_| "3".into())
                    .parse()?,
                multi_tool_policy: env::var("AGENT_MULTI_TOOL_POLICY")
                    .unwrap_or_else(|_| "first".into())
                    .parse()?,
                default_timezone: non_empty(env::var("AGENT_DEFAULT_TIMEZONE").ok())
                    .unwrap_or_else(|| "UTC".into()),
            },
            search: SearchSettings {
                base_url: env::var("SEARCH_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8888".into())
                    .trim_end_matches('/')
                    .to_string(),
                default_category: env::var("SEARCH_DEFAULT_CATEGORY")
                    .unwrap_or_else(|_| "text".into())
                    .to_lowercase(),
                default_backend: env::var("SEARCH_DEFAULT_BACKEND").unwrap_or_else(|_| "auto".into()),
                default_region: env::var("SEARCH_DEFAULT_REGION").unwrap_or_else(|_| "us-en".into()),
                default_safesearch: env::var("SEARCH_DEFAULT_SAFESEARCH")
                    .unwrap_or_else(|_| "moderate".into())
                    .to_lowercase(),
                default_timelimit: non_empty(env::var("SEARCH_DEFAULT_TIMELIMIT").ok()),
                timeout_seconds: env::var("SEARCH_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".into())
                    .parse()?,
                verify_ssl: parse_bool(&env::var("SEARCH_VERIFY_SSL").unwrap_or_else(|_| "true".into())),
                proxy: non_empty(env::var("SEARCH_PROXY").ok()),
                max_results: env::var("SEARCH_MAX_RESULTS").unwrap_or_else(|_| "10".into()).parse()?,
                cache_ttl_seconds: env::var("SEARCH_CACHE_TTL_SECONDS")
                    .unwrap_or_else(|_| "60".into())
                    .parse()?,
                cache_maxsize: env::var("SEARCH_CACHE_MAXSIZE")
                    .unwrap_or_else(|_| "128".into())
                    .parse()?,
            },
            conversion: ConversionSettings {
                max_file_size: env::var("MAX_FILE_SIZE")
                    .unwrap_or_else(|_| (50 * 1024 * 1024).to_string())
                    .parse()?,
                image_quality: env::var("IMAGE_COMPRESSION_QUALITY")
                    .unwrap_or_else(|_| "75".into())
                    .parse()?,
                image_max_dimension: env::var("IMAGE_MAX_DIMENSION")
                    .unwrap_or_else(|_| "2048".into())
                    .parse()?,
                libreoffice_path: env::var("LIBREOFFICE_PATH").unwrap_or_else(|_| "soffice".into()),
                libreoffice_timeout_seconds: env::var("LIBREOFFICE_TIMEOUT")
                    .unwrap_or_else(|_| "120".into())
                    .parse()?,
                pdftoppm_path: env::var("PDFTOPPM_PATH").unwrap_or_else(|_| "pdftoppm".into()),
                pdf_dpi: env::var("PDF_TO_IMAGE_DPI").unwrap_or_else(|_| "150".into()).parse()?,
                workers: parse_optional("CONVERSION_WORKERS")?.unwrap_or(default_workers).max(1),
                queue_size: env::var("CONVERSION_QUEUE_SIZE")
                    .unwrap_or_else(|_| "64".into())
                    .parse::<usize>()?
                    .max(1),
            },
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Database: {}", self.database_path.display());
        info!("- Models: {}", self.models.iter().map(|m| m.id.as_str()).collect::<Vec<_>>().join(", "));
        info!("- LLM Backend: {}", self.llm.base_url);
        info!("- LLM API Key: {}", if self.llm.api_key.is_empty() { "<unset>" } else { "<redacted>" });
        info!("- Registration: {}", if self.auth.registration_token.is_empty() { "disabled" } else { "enabled" });
        info!(
            "- Agent: max {} iterations, {} retries, {} transport retries, multi-tool policy {:?}",
            self.agent.max_iterations,
            self.agent.max_retries,
            self.agent.max_transport_retries,
            self.agent.multi_tool_policy
        );
        info!("- Search: {} (timeout {}s, cache {} entries / {}s)",
            self.search.base_url,
            self.search.timeout_seconds,
            self.search.cache_maxsize,
            self.search.cache_ttl_seconds
        );
        info!("- Conversion: {} workers, queue {}, {} DPI",
            self.conversion.workers, self.conversion.queue_size, self.conversion.pdf_dpi);
        info!("- Max upload: {} bytes", self.conversion.max_file_size);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn find_model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

/// Parses `id:name[:vision]` entries separated by commas, or a JSON array of [`ModelInfo`].
pub fn parse_models(raw: &str) -> Result<Vec<ModelInfo>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("AVAILABLE_MODELS is not a valid JSON array");
    }

    let mut models = Vec::new();
    for entry in trimmed.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let id = parts.next().unwrap_or_default().trim();
        if id.is_empty() {
            return Err(anyhow!("Model entry '{}' has an empty id", entry));
        }
        let name = parts.next().map(str::trim).filter(|n| !n.is_empty()).unwrap_or(id);
        let supports_vision = parts
            .next()
            .map(|flag| matches!(flag.trim().to_lowercase().as_str(), "vision" | "true" | "1" | "yes"))
            .unwrap_or(false);
        models.push(ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            supports_vision,
        });
    }
    Ok(models)
}

fn parse_optional<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(env::var(key).ok()) {
        Some(raw) if matches!(raw.as_str(), "None" | "none" | "null" | "Null") => Ok(None),
        Some(raw) => Ok(Some(raw.parse().with_context(|| format!("Invalid value for {}", key))?)),
        None => Ok(None),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Everything except an explicit false-like value counts as true.
fn parse_bool(raw: &str) -> bool {
    !matches!(raw.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Config with small limits, shared by tests across the crate.
    pub(crate) fn create_test_config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            database_path: PathBuf::from("./data/test.db"),
            models: vec![
                ModelInfo {
                    id: "vision-model".to_string(),
                    name: "Vision Model".to_string(),
                    supports_vision: true,
                },
                ModelInfo {
                    id: "text-model".to_string(),
                    name: "Text Model".to_string(),
                    supports_vision: false,
                },
            ],
            auth: AuthSettings {
                registration_token: "let-me-in".to_string(),
                jwt_secret: "test-secret-key".to_string(),
                access_token_expire_minutes: 30,
                refresh_token_expire_days: 7,
            },
            llm: LlmSettings {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: String::new(),
                temperature: 0.5,
                top_p: 1.0,
                max_tokens: None,
                frequency_penalty: 0.0,
                presence_penalty: 0.0,
                request_timeout_seconds: 5,
            },
            agent: AgentSettings {
                system_prompt: "You are a test assistant.".to_string(),
                multiple_tools_warning: "One tool per turn.".to_string(),
                self_check_prompt: "Check your answer.".to_string(),
                max_iterations: 5,
                max_retries: 2,
                max_transport_retries: 2,
                multi_tool_policy: MultiToolPolicy::First,
                default_timezone: "UTC".to_string(),
            },
            search: SearchSettings {
                base_url: "http://127.0.0.1:9".to_string(),
                default_category: "text".to_string(),
                default_backend: "auto".to_string(),
                default_region: "us-en".to_string(),
                default_safesearch: "moderate".to_string(),
                default_timelimit: None,
                timeout_seconds: 2,
                verify_ssl: true,
                proxy: None,
                max_results: 5,
                cache_ttl_seconds: 60,
                cache_maxsize: 16,
            },
            conversion: ConversionSettings {
                max_file_size: 1024 * 1024,
                image_quality: 75,
                image_max_dimension: 256,
                libreoffice_path: "soffice".to_string(),
                libreoffice_timeout_seconds: 5,
                pdftoppm_path: "pdftoppm".to_string(),
                pdf_dpi: 72,
                workers: 2,
                queue_size: 8,
            },
        }
    }

    // ===== API Address Tests =====

    #[test]
    fn test_api_addr_parsing() {
        let config = create_test_config();
        let addr = config.api_addr().unwrap();

        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn test_api_addr_rejects_garbage_host() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }

    // ===== Model List Tests =====

    #[test]
    fn test_parse_models_colon_format() {
        let models = parse_models("gpt-4o:GPT-4o:vision, local-llm:Local").unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "gpt-4o");
        assert!(models[0].supports_vision);
        assert_eq!(models[1].name, "Local");
        assert!(!models[1].supports_vision);
    }

    #[test]
    fn test_parse_models_name_defaults_to_id() {
        let models = parse_models("solo").unwrap();
        assert_eq!(models[0].name, "solo");
    }

    #[test]
    fn test_parse_models_json_format() {
        let models = parse_models(r#"[{"id":"a","name":"A","supports_vision":true}]"#).unwrap();
        assert_eq!(models, vec![ModelInfo { id: "a".into(), name: "A".into(), supports_vision: true }]);
    }

    #[test]
    fn test_parse_models_empty_id_is_error() {
        assert!(parse_models(":Nameless").is_err());
    }

    #[test]
    fn test_find_model() {
        let config = create_test_config();
        assert!(config.find_model("vision-model").unwrap().supports_vision);
        assert!(config.find_model("missing").is_none());
    }

    // ===== Value Parsing Tests =====

    #[test]
    fn test_parse_bool_false_like_values() {
        for raw in ["0", "false", "No", " off "] {
            assert!(!parse_bool(raw), "{raw} should be false");
        }
        for raw in ["1", "true", "yes", "anything"] {
            assert!(parse_bool(raw), "{raw} should be true");
        }
    }

    #[test]
    fn test_non_empty_trims() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some(" x ".into())), Some("x".into()));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn test_test_config_limits_are_consistent() {
        let config = create_test_config();
        assert!(config.agent.max_iterations > 0);
        assert!(config.conversion.workers > 0);
        assert!(config.conversion.queue_size > 0);
        assert!(config.search.cache_maxsize > 0);
    }
}
