use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::readiness::attempt_limit;

const ENV_FILE_VAR: &str = "SALES_AGENT_ENV_FILE";

/// Key/value lookup over the process environment layered on top of an
/// optional `.env` overlay. Process variables win over the overlay, and the
/// overlay wins over the defaults baked into [`AppConfig`].
#[derive(Clone, Debug, Default)]
pub struct EnvSource {
    process: HashMap<String, String>,
    overlay: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_process() -> Result<Self> {
        let env_file = env::var(ENV_FILE_VAR).unwrap_or_else(|_| ".env".to_string());
        let overlay = read_overlay(Path::new(&env_file))?;
        Ok(Self {
            process: env::vars().collect(),
            overlay,
        })
    }

    pub fn from_parts(process: HashMap<String, String>, overlay: HashMap<String, String>) -> Self {
        Self { process, overlay }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.process
            .get(key)
            .or_else(|| self.overlay.get(key))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            _ => default,
        }
    }
}

/// Reads a dotenv-style overlay file. A missing file yields an empty overlay.
pub fn read_overlay(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to open env overlay {}", path.display()))?;

    let mut out = HashMap::new();
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("malformed line in env overlay {}", path.display()))?;
        out.insert(key, value);
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct ReadinessConfig {
    pub interval: Duration,
    /// `None` keeps polling until the database answers.
    pub max_attempts: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub keyword_index_dir: PathBuf,
    pub qdrant_base_url: String,
    pub products_collection: String,
    pub solutions_collection: String,
    pub use_hybrid_retriever: bool,
    pub keyword_weight: f32,
    pub semantic_weight: f32,
}

#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub data_dir: PathBuf,
    pub max_items_per_file: usize,
    pub force_reload: bool,
    pub skip_loading: bool,
}

#[derive(Clone, Debug)]
pub struct AzureConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: String,
    pub deployment_name: String,
    pub embedding_endpoint: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_deployment_name: String,
    pub embedding_api_version: String,
}

#[derive(Clone, Debug)]
pub struct HuggingFaceConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct AiConfig {
    pub default_provider: String,
    pub azure: AzureConfig,
    pub huggingface: HuggingFaceConfig,
    pub token_usage_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub json: bool,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub readiness: ReadinessConfig,
    pub search: SearchConfig,
    pub catalog: CatalogConfig,
    pub ai: AiConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Ok(Self::from_source(&EnvSource::from_process()?))
    }

    pub fn from_source(env: &EnvSource) -> Self {
        let host = env.string("API_HOST", "0.0.0.0");
        let port: u16 = env.parse("API_PORT", 3001);

        let database_url = env.get("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                env.string("POSTGRES_USER", "myuser"),
                env.string("POSTGRES_PASSWORD", "mypassword"),
                env.string("POSTGRES_HOST", "db"),
                env.parse::<u16>("POSTGRES_PORT", 5432),
                env.string("POSTGRES_DB", "chat_db"),
            )
        });

        let max_attempts = attempt_limit(env.parse::<u32>("DB_WAIT_MAX_ATTEMPTS", 0));

        Self {
            server: ServerConfig {
                bind_addr: format!("{host}:{port}"),
                cors_origins: split_origins(&env.string("CORS_ORIGINS", "http://localhost:3000")),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10),
            },
            readiness: ReadinessConfig {
                interval: Duration::from_millis(env.parse("DB_WAIT_INTERVAL_MS", 1_000)),
                max_attempts,
            },
            search: SearchConfig {
                keyword_index_dir: PathBuf::from(
                    env.string("KEYWORD_INDEX_DIR", "./data/keyword_index"),
                ),
                qdrant_base_url: env.string("QDRANT_BASE_URL", "http://127.0.0.1:6333"),
                products_collection: env.string("QDRANT_PRODUCTS_COLLECTION", "products"),
                solutions_collection: env.string("QDRANT_SOLUTIONS_COLLECTION", "solutions"),
                use_hybrid_retriever: env.flag("USE_HYBRID_RETRIEVER", true),
                keyword_weight: env.parse("KEYWORD_WEIGHT", 0.4),
                semantic_weight: env.parse("SEMANTIC_WEIGHT", 0.6),
            },
            catalog: CatalogConfig {
                data_dir: PathBuf::from(env.string("DATA_DIR", "Data/json")),
                max_items_per_file: env.parse("CATALOG_MAX_ITEMS_PER_FILE", 50),
                force_reload: env.flag("FORCE_RELOAD_DATA", false),
                skip_loading: env.flag("SKIP_DATA_LOADING", false),
            },
            ai: AiConfig {
                default_provider: env.string("DEFAULT_AI_PROVIDER", "azure_openai"),
                azure: AzureConfig {
                    api_key: env.get("AZURE_OPENAI_API_KEY"),
                    endpoint: env.get("AZURE_OPENAI_ENDPOINT"),
                    api_version: env.string("AZURE_OPENAI_API_VERSION", "2024-02-15-preview"),
                    deployment_name: env.string("AZURE_OPENAI_DEPLOYMENT_NAME", "gpt-4"),
                    embedding_endpoint: env.get("AZURE_EMBEDDING_ENDPOINT"),
                    embedding_api_key: env.get("AZURE_EMBEDDING_API_KEY"),
                    embedding_deployment_name: env
                        .string("AZURE_EMBEDDING_DEPLOYMENT_NAME", "text-embedding-ada-002"),
                    embedding_api_version: env.string("AZURE_EMBEDDING_API_VERSION", "2023-05-15"),
                },
                huggingface: HuggingFaceConfig {
                    api_key: env.get("HUGGINGFACE_API_KEY"),
                    model: env.string("HUGGINGFACE_MODEL", "microsoft/DialoGPT-medium"),
                    base_url: env.string(
                        "HUGGINGFACE_BASE_URL",
                        "https://api-inference.huggingface.co/models",
                    ),
                },
                token_usage_path: PathBuf::from(
                    env.string("TOKEN_USAGE_PATH", "Data/token_usage.json"),
                ),
            },
            logging: LoggingConfig {
                log_dir: PathBuf::from(env.string("LOG_DIR", "logs")),
                json: env.flag("LOG_JSON", false),
            },
        }
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}
