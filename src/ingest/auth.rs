use crate::parse::{has_prefix_fold, query_unescape, strip_param};
use crate::upstream::{Credentials, credential_params};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderMap;
use http::header::AUTHORIZATION;

const HEADER_USER: &str = "x-clickhouse-user";
const HEADER_KEY: &str = "x-clickhouse-key";

/// Resolve request credentials with ClickHouse's precedence:
/// `X-ClickHouse-User`/`X-ClickHouse-Key` headers, then HTTP Basic, then
/// `user`/`password` URL params, then `("default", "")`.
pub fn resolve_credentials(headers: &HeaderMap, query_string: &str) -> Credentials {
    if let Some(user) = header_str(headers, HEADER_USER) {
        return Credentials {
            user: user.to_string(),
            pass: header_str(headers, HEADER_KEY).unwrap_or_default().to_string(),
        };
    }

    if let Some(creds) = basic_auth(headers) {
        return creds;
    }

    let mut user = None;
    let mut pass = None;
    for p in query_string.split('&') {
        if has_prefix_fold(p, "user=") {
            user = query_unescape(&p[5..]);
        } else if has_prefix_fold(p, "password=") {
            pass = query_unescape(&p[9..]);
        }
    }
    if user.is_some() || pass.is_some() {
        return Credentials {
            user: user.unwrap_or_else(|| "default".to_string()),
            pass: pass.unwrap_or_default(),
        };
    }

    Credentials::default()
}

/// Rebuild the query string so the resolved credentials ride as canonical
/// leading `user`/`password` params (they become part of the batcher key:
/// different credentials must never share a batch).
pub fn fold_credentials(query_string: &str, creds: &Credentials) -> String {
    let stripped = strip_param(&strip_param(query_string, "user"), "password");
    if *creds == Credentials::default() {
        return stripped;
    }
    if stripped.is_empty() {
        credential_params(creds)
    } else {
        format!("{}&{}", credential_params(creds), stripped)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn basic_auth(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if !has_prefix_fold(value, "basic ") {
        return None;
    }
    let decoded = BASE64.decode(value[6..].trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some(Credentials {
        user: user.to_string(),
        pass: pass.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn basic_header(user: &str, pass: &str) -> HeaderValue {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).expect("header value")
    }

    #[test]
    fn header_beats_basic_beats_url() {
        let mut headers = HeaderMap::new();
        headers.insert("x-clickhouse-user", HeaderValue::from_static("u1"));
        headers.insert(AUTHORIZATION, basic_header("u2", "p2"));
        let creds = resolve_credentials(&headers, "user=u3&password=p3");
        assert_eq!(creds.user, "u1");
        assert_eq!(creds.pass, "");
    }

    #[test]
    fn basic_beats_url() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, basic_header("u2", "p2"));
        let creds = resolve_credentials(&headers, "user=u3&password=p3");
        assert_eq!(creds.user, "u2");
        assert_eq!(creds.pass, "p2");
    }

    #[test]
    fn url_params_apply_when_no_headers() {
        let creds = resolve_credentials(&HeaderMap::new(), "user=u3&password=p3&query=SELECT+1");
        assert_eq!(creds.user, "u3");
        assert_eq!(creds.pass, "p3");
    }

    #[test]
    fn defaults_when_nothing_given() {
        let creds = resolve_credentials(&HeaderMap::new(), "query=SELECT+1");
        assert_eq!(creds, Credentials::default());
    }

    #[test]
    fn fold_replaces_url_credentials() {
        let creds = Credentials {
            user: "u1".to_string(),
            pass: "p1".to_string(),
        };
        let folded = fold_credentials("user=u3&password=p3&query=SELECT+1", &creds);
        assert_eq!(folded, "user=u1&password=p1&query=SELECT+1");
    }

    #[test]
    fn fold_with_default_credentials_strips_only() {
        let folded = fold_credentials("user=u3&query=SELECT+1", &Credentials::default());
        assert_eq!(folded, "query=SELECT+1");

        let folded = fold_credentials("query=SELECT+1", &Credentials::default());
        assert_eq!(folded, "query=SELECT+1");
    }
}
