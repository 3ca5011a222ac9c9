// Relay configuration, read once from the environment at startup.
//
// | Variable                      | Default          | Meaning                                   |
// |-------------------------------|------------------|-------------------------------------------|
// | COWRITE_RELAY_BIND_ADDR       | 0.0.0.0:8080     | Listen address                            |
// | COWRITE_RELAY_DATABASE_URL    | (unset)          | Postgres URL; unset = in-memory stores    |
// | COWRITE_RELAY_VERIFY_URL      | (unset)          | External verifier; unset = local verifier |
// | COWRITE_RELAY_TOKEN_SECRET    | (dev secret)     | HS256 secret for collaboration tokens     |
// | COWRITE_RELAY_INTERNAL_TOKEN  | (dev token)      | Bearer token for /internal endpoints      |
// | COWRITE_RELAY_LOG             | info             | Log filter when RUST_LOG is unset         |

use std::env::VarError;
use std::net::SocketAddr;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_LOG_FILTER: &str = "info";

const DEV_TOKEN_SECRET: &str = "cowrite-dev-token-secret-do-not-use-in-production";
const DEV_INTERNAL_TOKEN: &str = "cowrite-dev-internal-token";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub verify_url: Option<String>,
    pub token_secret: String,
    pub internal_token: String,
    pub log_filter: String,
}

impl RelayConfig {
    pub fn from_env() -> RelayConfig {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup so
    /// tests never touch process-global environment state.
    pub fn from_env_fn<F>(get: F) -> RelayConfig
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let var = |key: &str| get(key).ok().filter(|value| !value.trim().is_empty());

        let bind_addr = var("COWRITE_RELAY_BIND_ADDR")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(default_bind_addr);

        RelayConfig {
            bind_addr,
            database_url: var("COWRITE_RELAY_DATABASE_URL"),
            verify_url: var("COWRITE_RELAY_VERIFY_URL"),
            token_secret: var("COWRITE_RELAY_TOKEN_SECRET")
                .unwrap_or_else(|| DEV_TOKEN_SECRET.to_owned()),
            internal_token: var("COWRITE_RELAY_INTERNAL_TOKEN")
                .unwrap_or_else(|| DEV_INTERNAL_TOKEN.to_owned()),
            log_filter: var("COWRITE_RELAY_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned()),
        }
    }

    /// True when the token secret is still the built-in development value.
    pub fn is_dev_token_secret(&self) -> bool {
        self.token_secret == DEV_TOKEN_SECRET
    }

    /// True when the internal bearer token is still the built-in development value.
    pub fn is_dev_internal_token(&self) -> bool {
        self.internal_token == DEV_INTERNAL_TOKEN
    }
}

fn default_bind_addr() -> SocketAddr {
    DEFAULT_BIND_ADDR.parse().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from_map(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Result<String, VarError> {
        move |key| map.get(key).map(|value| (*value).to_owned()).ok_or(VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, None);
        assert_eq!(config.verify_url, None);
        assert_eq!(config.log_filter, "info");
        assert!(config.is_dev_token_secret());
        assert!(config.is_dev_internal_token());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = RelayConfig::from_env_fn(env_from_map(HashMap::from([
            ("COWRITE_RELAY_BIND_ADDR", "127.0.0.1:9090"),
            ("COWRITE_RELAY_DATABASE_URL", "postgres://db.internal/cowrite?sslmode=require"),
            ("COWRITE_RELAY_VERIFY_URL", "https://app.internal/collaboration/verify"),
            ("COWRITE_RELAY_TOKEN_SECRET", "a-real-secret-with-enough-entropy-0123456789"),
            ("COWRITE_RELAY_INTERNAL_TOKEN", "a-real-internal-token"),
            ("COWRITE_RELAY_LOG", "debug,sqlx=warn"),
        ])));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9090");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://db.internal/cowrite?sslmode=require")
        );
        assert_eq!(config.verify_url.as_deref(), Some("https://app.internal/collaboration/verify"));
        assert_eq!(config.log_filter, "debug,sqlx=warn");
        assert!(!config.is_dev_token_secret());
        assert!(!config.is_dev_internal_token());
    }

    #[test]
    fn unparseable_bind_addr_falls_back_to_the_default() {
        let config = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "COWRITE_RELAY_BIND_ADDR",
            "not-an-address",
        )])));
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = RelayConfig::from_env_fn(env_from_map(HashMap::from([
            ("COWRITE_RELAY_DATABASE_URL", "   "),
            ("COWRITE_RELAY_VERIFY_URL", ""),
        ])));
        assert_eq!(config.database_url, None);
        assert_eq!(config.verify_url, None);
    }
}
