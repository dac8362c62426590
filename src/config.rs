use log::warn;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_DEVICE_TICKET_TTL: Duration = Duration::from_secs(15 * 60);

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub sqlite_path: String,
    pub app_domain: String,
    pub bootstrap_token: String,
    pub rate_limit_rps: f64,
    pub max_body_bytes: usize,
    pub max_ws_msg_bytes: usize,
    pub secure_cookies: bool,
    pub session_ttl: Duration,
    pub challenge_ttl: Duration,
    pub max_ws_conn_per_ip: usize,
    pub max_ws_conn_global: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_or("LISTEN_ADDR", ":8080"),
            sqlite_path: env_or("SQLITE_PATH", "/data/flowline.db"),
            app_domain: env_or("APP_DOMAIN", ""),
            bootstrap_token: env_or("BOOTSTRAP_TOKEN", ""),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS", 5.0),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 256 * 1024),
            max_ws_msg_bytes: env_parse("MAX_WS_MSG_BYTES", 256 * 1024),
            secure_cookies: env_or("SECURE_COOKIES", "true") == "true",
            session_ttl: session_ttl_from_env(),
            challenge_ttl: Duration::from_secs(env_parse("CHALLENGE_TTL_SEC", 60)),
            max_ws_conn_per_ip: env_parse("MAX_WS_CONN_PER_IP", 5),
            max_ws_conn_global: env_parse("MAX_WS_CONN_GLOBAL", 1000),
        }
    }

    /// Go-style bare-port addresses (`:8080`) bind every interface.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr).parse()
        } else {
            self.listen_addr.parse()
        }
    }
}

pub fn is_dev_env() -> bool {
    env::var("FF_DEV").as_deref() == Ok("1")
        || env::var("APP_ENV").as_deref() == Ok("dev")
        || env::var("ENV").as_deref() == Ok("dev")
}

pub fn is_prod_env() -> bool {
    env::var("ENV").as_deref() == Ok("prod")
}

/// The HMAC key for tokens. A real key is always accepted; the well-known
/// dev key is only usable in dev mode with insecure cookies.
pub fn resolve_session_key(secure_cookies: bool) -> Result<String, String> {
    let session_key = env::var("SESSION_KEY").unwrap_or_default();
    if session_key.is_empty() || session_key == "dev-session-key" {
        if secure_cookies || !is_dev_env() {
            return Err("SESSION_KEY is required".to_string());
        }
        if session_key.is_empty() {
            warn!("using default dev-session-key");
        }
        return Ok("dev-session-key".to_string());
    }
    Ok(session_key)
}

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => val.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn session_ttl_from_env() -> Duration {
    if let Ok(val) = env::var("SESSION_TTL_HOURS") {
        if let Ok(hours) = val.trim().parse::<f64>() {
            if hours.is_finite() && hours >= 0.0 {
                return Duration::from_secs_f64(hours * 3600.0);
            }
        }
    }
    if let Ok(val) = env::var("SESSION_TTL") {
        if let Some(ttl) = parse_duration(&val) {
            return ttl;
        }
    }
    Duration::from_secs(12 * 3600)
}

/// Minimal duration strings: `90s`, `30m`, `12h`.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: f64 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_strings() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("12h"), Some(Duration::from_secs(43200)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("12"), None);
        assert_eq!(parse_duration("-5m"), None);
        assert_eq!(parse_duration("h"), None);
    }

    #[test]
    fn bare_port_listen_addr_binds_all_interfaces() {
        let mut cfg = Config::from_env();
        cfg.listen_addr = ":8080".to_string();
        assert_eq!(
            cfg.listen_socket_addr().unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );

        cfg.listen_addr = "127.0.0.1:9000".to_string();
        assert_eq!(
            cfg.listen_socket_addr().unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
    }
}
