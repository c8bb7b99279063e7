use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::env;
use std::fs;
use std::str::FromStr;

pub const SAMPLE_CONFIG_PATH: &str = "config.sample.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen: String,
    pub flush_count: usize,
    pub flush_interval_ms: u64,
    pub clean_interval_ms: u64,
    pub remove_query_id: bool,
    /// Seconds between dump replay passes; negative disables the replayer.
    pub dump_check_interval_s: i64,
    pub dump_dir: String,
    pub debug: bool,
    pub log_queries: bool,
    pub metrics_prefix: String,
    pub use_tls: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub clickhouse: ClickhouseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClickhouseConfig {
    pub servers: Vec<String>,
    /// Seconds a server stays out of rotation after being marked bad.
    pub down_timeout_s: i64,
    pub connect_timeout_s: u64,
    /// Hostname used for certificate verification when servers are
    /// addressed by IP.
    pub tls_server_name: String,
    pub insecure_tls_skip_verify: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: ":8124".to_string(),
            flush_count: 10_000,
            flush_interval_ms: 1000,
            clean_interval_ms: 0,
            remove_query_id: true,
            dump_check_interval_s: 300,
            dump_dir: "dumps".to_string(),
            debug: false,
            log_queries: false,
            metrics_prefix: String::new(),
            use_tls: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            clickhouse: ClickhouseConfig::default(),
        }
    }
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            servers: vec!["http://127.0.0.1:8123".to_string()],
            down_timeout_s: 60,
            connect_timeout_s: 10,
            tls_server_name: String::new(),
            insecure_tls_skip_verify: false,
        }
    }
}

/// Load configuration: the requested file, falling back to
/// `config.sample.json`, falling back to compiled-in defaults. Environment
/// overrides apply on top of whichever source won.
pub fn load(path: &str) -> AppResult<AppConfig> {
    let mut cnf = read_file(path)
        .or_else(|| read_file(SAMPLE_CONFIG_PATH))
        .unwrap_or_default();
    apply_env_overrides(&mut cnf);
    cnf.validate()?;
    Ok(cnf)
}

fn read_file(path: &str) -> Option<AppConfig> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(cnf) => Some(cnf),
        Err(e) => {
            tracing::warn!(path, error = %e, "config file unparseable, falling back");
            None
        }
    }
}

fn apply_env_overrides(cnf: &mut AppConfig) {
    env_override(&mut cnf.listen, "CLICKHOUSE_LISTEN");
    env_override(&mut cnf.flush_count, "CLICKHOUSE_FLUSH_COUNT");
    env_override(&mut cnf.flush_interval_ms, "CLICKHOUSE_FLUSH_INTERVAL_MS");
    env_override(&mut cnf.clean_interval_ms, "CLICKHOUSE_CLEAN_INTERVAL_MS");
    env_override(&mut cnf.remove_query_id, "CLICKHOUSE_REMOVE_QUERY_ID");
    env_override(&mut cnf.dump_check_interval_s, "CLICKHOUSE_DUMP_CHECK_INTERVAL_S");
    env_override(&mut cnf.dump_dir, "CLICKHOUSE_DUMP_DIR");
    env_override(&mut cnf.debug, "CLICKHOUSE_BULK_DEBUG");
    env_override(&mut cnf.log_queries, "CLICKHOUSE_LOG_QUERIES");
    env_override(&mut cnf.metrics_prefix, "CLICKHOUSE_METRICS_PREFIX");
    env_override(&mut cnf.use_tls, "CLICKHOUSE_USE_TLS");
    env_override(&mut cnf.tls_cert_file, "CLICKHOUSE_TLS_CERT_FILE");
    env_override(&mut cnf.tls_key_file, "CLICKHOUSE_TLS_KEY_FILE");

    if let Ok(v) = env::var("CLICKHOUSE_SERVERS") {
        cnf.clickhouse.servers = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    env_override(&mut cnf.clickhouse.down_timeout_s, "CLICKHOUSE_DOWN_TIMEOUT_S");
    env_override(&mut cnf.clickhouse.connect_timeout_s, "CLICKHOUSE_CONNECT_TIMEOUT_S");
    env_override(&mut cnf.clickhouse.tls_server_name, "CLICKHOUSE_TLS_SERVER_NAME");
    env_override(
        &mut cnf.clickhouse.insecure_tls_skip_verify,
        "CLICKHOUSE_INSECURE_TLS_SKIP_VERIFY",
    );
}

fn env_override<T: FromStr>(target: &mut T, name: &str) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.listen.trim().is_empty() {
            return Err(AppError::InvalidConfig("listen must not be empty".into()));
        }
        if self.flush_count == 0 {
            return Err(AppError::InvalidConfig("flush_count must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(AppError::InvalidConfig(
                "flush_interval_ms must be > 0".into(),
            ));
        }
        if self.use_tls && (self.tls_cert_file.is_empty() || self.tls_key_file.is_empty()) {
            return Err(AppError::InvalidConfig(
                "use_tls requires tls_cert_file and tls_key_file".into(),
            ));
        }

        if self.clickhouse.servers.is_empty() {
            return Err(AppError::InvalidConfig(
                "clickhouse.servers must define at least one server".into(),
            ));
        }
        for (i, url) in self.clickhouse.servers.iter().enumerate() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(AppError::InvalidConfig(format!(
                    "clickhouse.servers[{i}]: '{url}' must start with http:// or https://"
                )));
            }
        }
        if self.clickhouse.connect_timeout_s == 0 {
            return Err(AppError::InvalidConfig(
                "clickhouse.connect_timeout_s must be > 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cnf = load("non_existent_config.json").expect("load");
        assert_eq!(cnf.listen, ":8124");
        assert_eq!(cnf.flush_count, 10_000);
        assert_eq!(cnf.flush_interval_ms, 1000);
        assert_eq!(cnf.dump_check_interval_s, 300);
        assert!(cnf.remove_query_id);
        assert_eq!(
            cnf.clickhouse.servers,
            vec!["http://127.0.0.1:8123".to_string()]
        );
        assert_eq!(cnf.clickhouse.down_timeout_s, 60);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"flush_count": 50}"#).expect("write config");

        let cnf = load(path.to_str().expect("path")).expect("load");
        assert_eq!(cnf.flush_count, 50);
        assert_eq!(cnf.flush_interval_ms, 1000);
    }

    #[test]
    fn tls_options_parse_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "clickhouse": {
                    "servers": ["https://127.0.0.1:8443"],
                    "tls_server_name": "example.com",
                    "insecure_tls_skip_verify": true
                }
            }"#,
        )
        .expect("write config");

        let cnf = load(path.to_str().expect("path")).expect("load");
        assert_eq!(cnf.clickhouse.tls_server_name, "example.com");
        assert!(cnf.clickhouse.insecure_tls_skip_verify);
    }

    // env vars are process-global: this test owns CLICKHOUSE_CLEAN_INTERVAL_MS
    // and CLICKHOUSE_BULK_DEBUG, nothing else asserts them
    #[test]
    fn env_overrides_win_over_file() {
        unsafe {
            env::set_var("CLICKHOUSE_CLEAN_INTERVAL_MS", "7500");
            env::set_var("CLICKHOUSE_BULK_DEBUG", "true");
        }
        let cnf = load("non_existent_config.json").expect("load");
        unsafe {
            env::remove_var("CLICKHOUSE_CLEAN_INTERVAL_MS");
            env::remove_var("CLICKHOUSE_BULK_DEBUG");
        }
        assert_eq!(cnf.clean_interval_ms, 7500);
        assert!(cnf.debug);
    }

    #[test]
    fn validate_rejects_empty_servers() {
        let cnf = AppConfig {
            clickhouse: ClickhouseConfig {
                servers: vec![],
                ..ClickhouseConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(cnf.validate().is_err());
    }

    #[test]
    fn sample_config_is_valid() {
        let raw = fs::read_to_string(SAMPLE_CONFIG_PATH).expect("config.sample.json present");
        let cnf: AppConfig = serde_json::from_str(&raw).expect("sample parses");
        cnf.validate().expect("sample validates");
        assert!(!cnf.clickhouse.servers.is_empty());
    }
}
