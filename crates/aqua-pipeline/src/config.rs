use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_BATCH: usize = 25;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// In-memory document store when unset.
    pub database_url: Option<String>,
    /// In-memory blob store when unset.
    pub blob_base_url: Option<String>,
    pub blob_bucket: String,
    pub inference_url: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reconcile_concurrency: usize,
    pub max_file_bytes: usize,
    pub max_batch: usize,
    pub mail_endpoint: Option<String>,
    pub mail_api_key: Option<String>,
    pub mail_from: String,
    pub app_url: String,
    pub web_port: u16,
    pub species_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            blob_base_url: None,
            blob_bucket: "aquasense".to_string(),
            inference_url: None,
            http_timeout_secs: 20,
            user_agent: "aquasense/0.1".to_string(),
            reconcile_concurrency: 8,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_batch: DEFAULT_MAX_BATCH,
            mail_endpoint: None,
            mail_api_key: None,
            mail_from: "noreply@aquasense.local".to_string(),
            app_url: "http://localhost:8000".to_string(),
            web_port: 8000,
            species_file: PathBuf::from("species.yaml"),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            blob_base_url: env_opt("AQUA_BLOB_BASE_URL"),
            blob_bucket: env_opt("AQUA_BLOB_BUCKET").unwrap_or(defaults.blob_bucket),
            inference_url: env_opt("AQUA_INFERENCE_URL"),
            http_timeout_secs: env_parse("AQUA_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: env_opt("AQUA_USER_AGENT").unwrap_or(defaults.user_agent),
            reconcile_concurrency: env_parse("AQUA_RECONCILE_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.reconcile_concurrency),
            max_file_bytes: env_parse("AQUA_MAX_FILE_BYTES").unwrap_or(defaults.max_file_bytes),
            max_batch: env_parse("AQUA_MAX_BATCH").unwrap_or(defaults.max_batch),
            mail_endpoint: env_opt("AQUA_MAIL_ENDPOINT"),
            mail_api_key: env_opt("AQUA_MAIL_API_KEY"),
            mail_from: env_opt("AQUA_MAIL_FROM").unwrap_or(defaults.mail_from),
            app_url: env_opt("AQUA_APP_URL").unwrap_or(defaults.app_url),
            web_port: env_parse("AQUA_WEB_PORT").unwrap_or(defaults.web_port),
            species_file: env_opt("AQUA_SPECIES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.species_file),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_opt(name).and_then(|v| v.parse().ok())
}
