// Gateway configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. A `.env` file in the working directory is loaded first when
// present (see `main`).

use std::{env::VarError, net::SocketAddr, path::PathBuf, str::FromStr};

/// Core gateway configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Session store URL (`redis://host:port/db`).
    pub redis_url: String,
    /// Bus channel receiving every inbound chat frame verbatim.
    pub app_channel: String,
    /// Bus channel receiving presence descriptors.
    pub presence_channel: String,
    /// Key prefix for token, blocked-set and display-name keys.
    pub users_prefix: String,
    /// Key prefix for per-session history hashes.
    pub messages_prefix: String,
    /// Maximum history entries kept per video session.
    pub max_history: usize,
    /// Capacity of each client's outbound frame queue.
    pub outbound_capacity: usize,
    pub tls: Option<TlsConfig>,
    /// Serve the local test page at `/` and move the socket to `/ws`.
    pub test_mode: bool,
    pub home_page: PathBuf,
    /// Log filter directive (e.g. `info`, `sessionchat_relay=debug`).
    pub log_filter: String,
    pub log_json: bool,
    /// Variables that were set but held an unusable value; their defaults apply.
    pub ignored_vars: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

const DEFAULT_MAX_HISTORY: usize = 50;
const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SESSIONCHAT_ADDR` | `0.0.0.0:8080` |
    /// | `SESSIONCHAT_REDIS_URL` | `redis://127.0.0.1:6379/` |
    /// | `SESSIONCHAT_APP_CHANNEL` | `chat` |
    /// | `SESSIONCHAT_PRESENCE_CHANNEL` | `presence` |
    /// | `SESSIONCHAT_USERS_PREFIX` | *(empty)* |
    /// | `SESSIONCHAT_MESSAGES_PREFIX` | `messages` |
    /// | `SESSIONCHAT_MESSAGE_COUNT` | `50` |
    /// | `SESSIONCHAT_OUTBOUND_CAPACITY` | `256` |
    /// | `SESSIONCHAT_TLS` | off |
    /// | `SESSIONCHAT_TLS_CERT` | `./ssl/certificate.pem` |
    /// | `SESSIONCHAT_TLS_KEY` | `./ssl/privatekey.pem` |
    /// | `SESSIONCHAT_TEST` | off |
    /// | `SESSIONCHAT_HOME_PAGE` | `home.html` |
    /// | `SESSIONCHAT_LOG_FILTER` | `info` |
    /// | `SESSIONCHAT_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let mut ignored_vars = Vec::new();
        let listen_addr = parse_var(&env, "SESSIONCHAT_ADDR", &mut ignored_vars, |_| true)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let redis_url = env("SESSIONCHAT_REDIS_URL")
            .map(|v| normalize_redis_url(&v))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());

        let app_channel = env("SESSIONCHAT_APP_CHANNEL").unwrap_or_else(|_| "chat".into());
        let presence_channel =
            env("SESSIONCHAT_PRESENCE_CHANNEL").unwrap_or_else(|_| "presence".into());
        let users_prefix = env("SESSIONCHAT_USERS_PREFIX").unwrap_or_default();
        let messages_prefix =
            env("SESSIONCHAT_MESSAGES_PREFIX").unwrap_or_else(|_| "messages".into());

        let max_history =
            parse_var(&env, "SESSIONCHAT_MESSAGE_COUNT", &mut ignored_vars, |_| true)
                .unwrap_or(DEFAULT_MAX_HISTORY);
        let outbound_capacity = parse_var(
            &env,
            "SESSIONCHAT_OUTBOUND_CAPACITY",
            &mut ignored_vars,
            |capacity: &usize| *capacity > 0,
        )
        .unwrap_or(DEFAULT_OUTBOUND_CAPACITY);

        let tls = env("SESSIONCHAT_TLS").ok().filter(|v| is_truthy(v)).map(|_| TlsConfig {
            cert_path: env("SESSIONCHAT_TLS_CERT")
                .unwrap_or_else(|_| "./ssl/certificate.pem".into())
                .into(),
            key_path: env("SESSIONCHAT_TLS_KEY")
                .unwrap_or_else(|_| "./ssl/privatekey.pem".into())
                .into(),
        });

        let test_mode = env("SESSIONCHAT_TEST").map(|v| is_truthy(&v)).unwrap_or(false);
        let home_page = env("SESSIONCHAT_HOME_PAGE").unwrap_or_else(|_| "home.html".into()).into();

        let log_filter = env("SESSIONCHAT_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("SESSIONCHAT_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self {
            listen_addr,
            redis_url,
            app_channel,
            presence_channel,
            users_prefix,
            messages_prefix,
            max_history,
            outbound_capacity,
            tls,
            test_mode,
            home_page,
            log_filter,
            log_json,
            ignored_vars,
        }
    }
}

/// Parse `key` when it is set. A value that fails to parse or is rejected by
/// `valid` is recorded in `ignored` and treated as unset.
fn parse_var<T, F>(
    env: &F,
    key: &'static str,
    ignored: &mut Vec<&'static str>,
    valid: fn(&T) -> bool,
) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Result<String, VarError>,
{
    let raw = env(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        _ => {
            ignored.push(key);
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Accepts a bare `host:port` as well as a full `redis://` / `rediss://` URL.
fn normalize_redis_url(value: &str) -> String {
    let value = value.trim();
    if value.contains("://") {
        value.to_string()
    } else {
        format!("redis://{value}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379/");
        assert_eq!(cfg.app_channel, "chat");
        assert_eq!(cfg.presence_channel, "presence");
        assert_eq!(cfg.users_prefix, "");
        assert_eq!(cfg.messages_prefix, "messages");
        assert_eq!(cfg.max_history, 50);
        assert_eq!(cfg.outbound_capacity, 256);
        assert!(cfg.tls.is_none());
        assert!(!cfg.test_mode);
        assert_eq!(cfg.home_page, PathBuf::from("home.html"));
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.log_json);
        assert!(cfg.ignored_vars.is_empty());
    }

    #[test]
    fn custom_listen_addr() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_ADDR", "127.0.0.1:3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_listen_addr_uses_default() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_ADDR", "not an address");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.ignored_vars, vec!["SESSIONCHAT_ADDR"]);
    }

    #[test]
    fn bare_redis_address_gets_a_scheme() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_REDIS_URL", "cache.internal:6380");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.redis_url, "redis://cache.internal:6380/");
    }

    #[test]
    fn full_redis_url_is_kept() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_REDIS_URL", "rediss://user:pw@cache:6379/2");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.redis_url, "rediss://user:pw@cache:6379/2");
    }

    #[test]
    fn bus_and_key_namespaces_from_env() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_APP_CHANNEL", "laravel_chat");
        m.insert("SESSIONCHAT_PRESENCE_CHANNEL", "laravel_presence");
        m.insert("SESSIONCHAT_USERS_PREFIX", "shop_");
        m.insert("SESSIONCHAT_MESSAGES_PREFIX", "shop_messages");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.app_channel, "laravel_chat");
        assert_eq!(cfg.presence_channel, "laravel_presence");
        assert_eq!(cfg.users_prefix, "shop_");
        assert_eq!(cfg.messages_prefix, "shop_messages");
    }

    #[test]
    fn history_cap_override_and_invalid_fallback() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_MESSAGE_COUNT", "200");
        assert_eq!(RelayConfig::from_env_fn(env_from_map(m)).max_history, 200);

        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_MESSAGE_COUNT", "-3");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.max_history, 50);
        assert_eq!(cfg.ignored_vars, vec!["SESSIONCHAT_MESSAGE_COUNT"]);
    }

    #[test]
    fn zero_outbound_capacity_uses_default() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_OUTBOUND_CAPACITY", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.outbound_capacity, 256);
        assert_eq!(cfg.ignored_vars, vec!["SESSIONCHAT_OUTBOUND_CAPACITY"]);
    }

    #[test]
    fn tls_enabled_with_default_paths() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_TLS", "yes");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(
            cfg.tls,
            Some(TlsConfig {
                cert_path: "./ssl/certificate.pem".into(),
                key_path: "./ssl/privatekey.pem".into(),
            })
        );
    }

    #[test]
    fn tls_disabled_by_falsy_flag() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_TLS", "no");
        m.insert("SESSIONCHAT_TLS_CERT", "/etc/cert.pem");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn test_mode_and_home_page() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_TEST", "true");
        m.insert("SESSIONCHAT_HOME_PAGE", "static/home.html");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.test_mode);
        assert_eq!(cfg.home_page, PathBuf::from("static/home.html"));
    }

    #[test]
    fn log_settings_override() {
        let mut m = HashMap::new();
        m.insert("SESSIONCHAT_LOG_FILTER", "debug,tower_http=trace");
        m.insert("SESSIONCHAT_LOG_FORMAT", "JSON");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
        assert!(cfg.log_json);
    }
}
