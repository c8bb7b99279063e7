pub mod pool;
pub mod sender;

pub use pool::*;
pub use sender::*;

use crate::error::AppResult;
use crate::parse::{has_prefix_fold, query_escape, query_unescape};
use async_trait::async_trait;

/// One flush-worth of rows addressed to a single table.
///
/// `params` carries the non-query URL parameters; the statement itself rides
/// in `content` (prefix, newline, rows).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub params: String,
    pub query: String,
    pub content: String,
    pub count: usize,
    pub is_insert: bool,
}

/// Auth pair resolved per request and forwarded upstream as
/// `X-ClickHouse-User` / `X-ClickHouse-Key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "default".to_string(),
            pass: String::new(),
        }
    }
}

/// Narrow enqueue capability handed to each table batcher. Batchers hand
/// batches over and never manage the sender's lifetime.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Queue a batch for delivery. Blocks when the bounded queue is full,
    /// back-pressuring the caller.
    async fn enqueue(&self, req: BatchRequest);

    /// Block until every queued batch has been processed.
    async fn wait_flush(&self);
}

/// Synchronous delivery seam shared by the worker, the dump replayer, and
/// tests.
#[async_trait]
pub trait QuerySender: Send + Sync {
    /// Send one request through the server-cycle retry loop. `Ok` carries a
    /// 2xx/3xx status and the response body.
    async fn send_query(&self, req: &BatchRequest) -> AppResult<(u16, String)>;
}

/// Pull `user`/`password` out of a canonical params string. The remainder is
/// what goes on the upstream URL; the credentials travel as headers instead.
pub fn split_credentials(params: &str) -> (String, Option<Credentials>) {
    let mut user = None;
    let mut pass = None;
    let mut rest = String::new();

    for p in params.split('&') {
        if has_prefix_fold(p, "user=") {
            user = query_unescape(&p[5..]);
        } else if has_prefix_fold(p, "password=") {
            pass = query_unescape(&p[9..]);
        } else if !p.is_empty() {
            if !rest.is_empty() {
                rest.push('&');
            }
            rest.push_str(p);
        }
    }

    let creds = if user.is_some() || pass.is_some() {
        Some(Credentials {
            user: user.unwrap_or_else(|| "default".to_string()),
            pass: pass.unwrap_or_default(),
        })
    } else {
        None
    };

    (rest, creds)
}

/// Re-encode credentials as leading `user`/`password` params.
pub fn credential_params(creds: &Credentials) -> String {
    format!(
        "user={}&password={}",
        query_escape(&creds.user),
        query_escape(&creds.pass)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_credentials_extracts_pair() {
        let (rest, creds) = split_credentials("user=u1&password=p1&query=SELECT+1");
        assert_eq!(rest, "query=SELECT+1");
        let creds = creds.expect("credentials");
        assert_eq!(creds.user, "u1");
        assert_eq!(creds.pass, "p1");
    }

    #[test]
    fn split_credentials_none_when_absent() {
        let (rest, creds) = split_credentials("query=SELECT+1&database=db");
        assert_eq!(rest, "query=SELECT+1&database=db");
        assert!(creds.is_none());
    }

    #[test]
    fn split_credentials_user_only() {
        let (rest, creds) = split_credentials("user=u1");
        assert_eq!(rest, "");
        let creds = creds.expect("credentials");
        assert_eq!(creds.user, "u1");
        assert_eq!(creds.pass, "");
    }

    #[test]
    fn credential_params_escapes() {
        let creds = Credentials {
            user: "a b".to_string(),
            pass: "p&q".to_string(),
        };
        assert_eq!(credential_params(&creds), "user=a+b&password=p%26q");
    }
}
