use crate::appconfig::ClickhouseConfig;
use crate::error::{AppError, AppResult};

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One configured backend URL with its HTTP client and health state.
#[derive(Debug)]
struct UpstreamServer {
    url: String,
    client: reqwest::Client,
    bad: bool,
    last_request: Instant,
}

/// Server chosen for one attempt. Carries a cheap clone of the client so the
/// pool lock is never held across a request.
#[derive(Debug, Clone)]
pub struct PickedServer {
    pub index: usize,
    pub url: String,
    pub client: reqwest::Client,
}

/// Ordered list of upstream servers plus the selection/health policy.
///
/// A server is eligible iff it is not marked bad, or its bad mark has aged
/// past `down_timeout` seconds. Among eligible servers the least-recently
/// used one wins, which converges to round-robin under even load.
#[derive(Debug)]
pub struct ServerPool {
    servers: Mutex<Vec<UpstreamServer>>,
    down_timeout: i64,
}

impl ServerPool {
    pub fn new(cfg: &ClickhouseConfig) -> AppResult<Self> {
        let now = Instant::now();
        let mut servers = Vec::with_capacity(cfg.servers.len());
        for url in &cfg.servers {
            servers.push(UpstreamServer {
                url: effective_url(url, cfg)?,
                client: build_client(url, cfg)?,
                bad: false,
                last_request: now,
            });
        }
        Ok(Self {
            servers: Mutex::new(servers),
            down_timeout: cfg.down_timeout_s,
        })
    }

    /// Pick the least-recently-used eligible server and stamp it. `None`
    /// means every server is currently out of rotation.
    pub fn pick(&self) -> Option<PickedServer> {
        let mut servers = self.servers.lock().expect("server pool lock");
        let now = Instant::now();

        let mut best: Option<(usize, Instant)> = None;
        for (i, s) in servers.iter_mut().enumerate() {
            if s.bad {
                if now.duration_since(s.last_request).as_secs() as i64 > self.down_timeout {
                    s.bad = false;
                } else {
                    continue;
                }
            }
            if best.is_none_or(|(_, lr)| s.last_request < lr) {
                best = Some((i, s.last_request));
            }
        }

        let (index, _) = best?;
        servers[index].last_request = now;
        Some(PickedServer {
            index,
            url: servers[index].url.clone(),
            client: servers[index].client.clone(),
        })
    }

    pub fn mark_bad(&self, index: usize) {
        let mut servers = self.servers.lock().expect("server pool lock");
        if let Some(s) = servers.get_mut(index) {
            s.bad = true;
        }
    }

    /// (good, bad) counts for the health gauges.
    pub fn counts(&self) -> (i64, i64) {
        let servers = self.servers.lock().expect("server pool lock");
        let bad = servers.iter().filter(|s| s.bad).count() as i64;
        (servers.len() as i64 - bad, bad)
    }

}

/// When `tls_server_name` is set the configured URLs address servers by IP;
/// certificate verification then needs the real hostname, so the request URL
/// gets the hostname and the client pins it back to the configured address.
fn effective_url(url: &str, cfg: &ClickhouseConfig) -> AppResult<String> {
    if cfg.tls_server_name.is_empty() {
        return Ok(url.to_string());
    }
    let mut parsed = url::Url::parse(url)
        .map_err(|e| AppError::InvalidConfig(format!("invalid server url '{url}': {e}")))?;
    parsed
        .set_host(Some(&cfg.tls_server_name))
        .map_err(|e| AppError::InvalidConfig(format!("invalid tls_server_name: {e}")))?;
    Ok(parsed.to_string().trim_end_matches('/').to_string())
}

fn build_client(url: &str, cfg: &ClickhouseConfig) -> AppResult<reqwest::Client> {
    let mut builder =
        reqwest::Client::builder().timeout(Duration::from_secs(cfg.connect_timeout_s));

    if cfg.insecure_tls_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if !cfg.tls_server_name.is_empty() {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::InvalidConfig(format!("invalid server url '{url}': {e}")))?;
        let host = parsed.host_str().unwrap_or_default();
        let port = parsed.port_or_known_default().unwrap_or(8123);
        let ip: std::net::IpAddr = host.parse().map_err(|_| {
            AppError::InvalidConfig(format!(
                "tls_server_name requires servers addressed by IP, got '{host}'"
            ))
        })?;
        builder = builder.resolve(&cfg.tls_server_name, SocketAddr::new(ip, port));
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(urls: &[&str], down_timeout_s: i64) -> ServerPool {
        let cfg = ClickhouseConfig {
            servers: urls.iter().map(|s| s.to_string()).collect(),
            down_timeout_s,
            ..ClickhouseConfig::default()
        };
        ServerPool::new(&cfg).expect("pool")
    }

    #[test]
    fn selection_rotates_round_robin() {
        let p = pool(
            &[
                "http://127.0.0.1:8123",
                "http://127.0.0.1:8124",
                "http://127.0.0.1:8125",
            ],
            60,
        );
        let picks: Vec<usize> = (0..6).map(|_| p.pick().expect("server").index).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn bad_server_is_skipped() {
        let p = pool(&["http://127.0.0.1:8123", "http://127.0.0.1:8124"], 300);
        p.mark_bad(0);
        for _ in 0..4 {
            assert_eq!(p.pick().expect("server").index, 1);
        }
        assert_eq!(p.counts(), (1, 1));
    }

    #[test]
    fn all_bad_yields_none() {
        let p = pool(&["http://127.0.0.1:8123"], 300);
        p.mark_bad(0);
        assert!(p.pick().is_none());
    }

    #[test]
    fn negative_down_timeout_readmits_immediately() {
        let p = pool(&["http://127.0.0.1:8123"], -1);
        p.mark_bad(0);
        let picked = p.pick().expect("readmitted server");
        assert_eq!(picked.index, 0);
        assert_eq!(p.counts(), (1, 0));
    }

    #[test]
    fn tls_server_name_rewrites_ip_url() {
        let cfg = ClickhouseConfig {
            servers: vec!["https://10.0.0.5:8443".to_string()],
            tls_server_name: "ch.internal".to_string(),
            ..ClickhouseConfig::default()
        };
        let p = ServerPool::new(&cfg).expect("pool");
        let picked = p.pick().expect("server");
        assert_eq!(picked.url, "https://ch.internal:8443");
    }
}
