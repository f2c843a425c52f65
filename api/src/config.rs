use ::config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageBackend {
    Local,
    Cloudinary,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server_addr: String,
    pub database_url: String,
    pub cors_origin: String,
    /// Base URL used to build links in outgoing emails.
    pub public_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_token_days: i64,
    /// Lifetime of password-reset tokens.
    pub reset_token_minutes: i64,
    /// Accounts registered with this email are made administrators.
    pub admin_email: Option<String>,
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub comment_cache_ttl_secs: u64,
    pub max_page_size: u32,
    pub image_store: ImageBackend,
    pub upload_dir: String,
    pub cloudinary_cloud_name: Option<String>,
    pub cloudinary_api_key: Option<String>,
    pub cloudinary_api_secret: Option<String>,
}

impl AppConfig {
    /// Defaults, then an optional `config` file, then `BLOG_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("BLOG"))
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server_addr", "0.0.0.0:8080")?
            .set_default("database_url", "blog.db")?
            .set_default("cors_origin", "http://localhost:3000")?
            .set_default("public_url", "http://localhost:8080")?
            .set_default("jwt_secret", "dev-secret-change-me")?
            .set_default("jwt_expiry_minutes", 30)?
            .set_default("refresh_token_days", 7)?
            .set_default("reset_token_minutes", 60)?
            .set_default("cache_ttl_secs", 180)?
            .set_default("comment_cache_ttl_secs", 60)?
            .set_default("max_page_size", 50)?
            .set_default("image_store", "local")?
            .set_default("upload_dir", "./uploads")
    }

    /// Built-in defaults only, ignoring files and the environment.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder()?.build()?.try_deserialize()
    }
}
