use serde::Deserialize;

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_credential() -> String {
    "postgres".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Service configuration, sourced from the environment
/// (USE_IN_MEMORY_DB, DB_HOST, DB_USERNAME, DB_PASSWORD, PORT,
/// LIBRARIAN_EMAIL, LIBRARIAN_PASSWORD).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub use_in_memory_db: bool,
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default = "default_db_credential")]
    pub db_username: String,
    #[serde(default = "default_db_credential")]
    pub db_password: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When both are set, the account is created at startup with the
    /// librarian role (unless the email is already registered)
    #[serde(default)]
    pub librarian_email: Option<String>,
    #[serde(default)]
    pub librarian_password: Option<String>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
