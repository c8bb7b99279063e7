//! Lexical splitting of inbound queries into an INSERT prefix and row data.
//!
//! This is deliberately not a SQL parser: we do just enough work to find the
//! `FORMAT <fmt>` / `VALUES` terminator and re-encode the prefix back into a
//! `query=` parameter. A single-quoted literal containing the words FORMAT
//! or VALUES before the real terminator will be mis-split; that is a known
//! limitation of the lexical approach.

use regex::Regex;
use std::sync::LazyLock;
use url::form_urlencoded;

pub const FORMAT_VALUES: &str = "values";
pub const FORMAT_TAB_SEPARATED: &str = "TabSeparated";
pub const FORMAT_ROW_BINARY: &str = "RowBinary";

static RE_FORMAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)format\s\S+(\s+)").unwrap());
static RE_VALUES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\svalues\s").unwrap());
static RE_GET_FORMAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)format\s(\S+)").unwrap());

/// Case-insensitive ASCII prefix test.
pub fn has_prefix_fold(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// URL-encode a query value the way ClickHouse clients expect
/// (space becomes `+`).
pub fn query_escape(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Strict URL decode: `+` is a space, every `%` must carry two hex digits.
/// Returns `None` on a malformed escape so the caller can fall back to
/// passing the input through untouched.
pub fn query_unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Split a full statement into `(prefix, content)` at the first terminator
/// keyword. The uppercase fast paths mirror how clients normally send
/// queries; the regexes pick up mixed- and lower-case variants.
pub fn split_statement(text: &str) -> (String, String) {
    let fmt = text.find("FORMAT");
    let val = text.find("VALUES").or_else(|| text.find("values"));

    // FORMAT wins when it occurs before any VALUES.
    if let Some(i) = fmt {
        if val.is_none_or(|k| i < k) {
            return match end_of_format_token(text, i + 7) {
                Some(off) => (text[..off].to_string(), text[off..].to_string()),
                // FORMAT token is the last word; everything is prefix
                None => (text.to_string(), String::new()),
            };
        }
    }

    if let Some(k) = val {
        return (
            text[..k + 6].trim().to_string(),
            text[k + 6..].trim().to_string(),
        );
    }

    if let Some(caps) = RE_FORMAT.captures(text) {
        let off = caps.get(1).map(|m| m.end()).unwrap_or(0);
        if off > 0 {
            return (text[..off].to_string(), text[off..].to_string());
        }
    }

    if let Some(m) = RE_VALUES.find(text) {
        return (text[..m.end()].to_string(), text[m.end()..].to_string());
    }

    (text.to_string(), String::new())
}

/// Scan past the whitespace-delimited token following `FORMAT` and return
/// the offset just after its terminating space, newline, or `;`.
fn end_of_format_token(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_word = false;
    let mut c = from;
    while c < bytes.len() {
        let delim = bytes[c] == b' ' || bytes[c] == b'\n' || bytes[c] == b';';
        if !in_word && !delim {
            in_word = true;
        } else if in_word && delim {
            return Some(c + 1);
        }
        c += 1;
    }
    None
}

/// Parse an inbound request into `(params, content, is_insert)`.
///
/// `params` is the canonical parameter string: all non-query parameters in
/// their original order, then `query=<url-encoded trimmed prefix>`.
/// `content` is the row payload. Malformed URL encoding never fails: the
/// original inputs come back untouched with `is_insert = false`.
pub fn parse_query(query_string: &str, body: &str) -> (String, String, bool) {
    if let Some(i) = query_string.find("query=") {
        let after = &query_string[i + 6..];
        let (encoded, mut params) = match after.find('&') {
            Some(eoq) => (
                &after[..eoq],
                format!("{}{}", &query_string[..i], &after[eoq + 1..]),
            ),
            None => (after, query_string[..i].to_string()),
        };

        let Some(mut text) = query_unescape(encoded) else {
            return (query_string.to_string(), body.to_string(), false);
        };
        if !body.is_empty() {
            text.push(' ');
            text.push_str(body);
        }

        let insert = has_prefix_fold(&text, "insert");
        let (prefix, content) = split_statement(&text);

        if !params.is_empty() && !params.ends_with('&') {
            params.push('&');
        }
        params.push_str("query=");
        params.push_str(&query_escape(prefix.trim()));

        (
            params.trim().to_string(),
            content.trim().to_string(),
            insert,
        )
    } else {
        let (prefix, content) = split_statement(body);
        let prefix = prefix.trim();
        let insert = has_prefix_fold(prefix, "insert");

        let params = if query_string.is_empty() {
            format!("query={}", query_escape(prefix))
        } else {
            format!("{}&query={}", query_string, query_escape(prefix))
        };

        (
            params.trim().to_string(),
            content.trim().to_string(),
            insert,
        )
    }
}

/// Split a canonical batcher key back into `(decoded query, other params)`.
/// On a decode failure the whole key is treated as params.
pub fn separate_query(key: &str) -> (String, String) {
    let mut encoded = "";
    let mut params = String::new();
    for p in key.split('&') {
        if has_prefix_fold(p, "query=") {
            encoded = &p[6..];
        } else {
            if !params.is_empty() {
                params.push('&');
            }
            params.push_str(p);
        }
    }
    match query_unescape(encoded) {
        Some(q) => (q, params.trim().to_string()),
        None => (String::new(), key.to_string()),
    }
}

/// Drop every `name=` component from a parameter string, preserving the
/// order of the rest.
pub fn strip_param(params: &str, name: &str) -> String {
    let prefix = format!("{name}=");
    params
        .split('&')
        .filter(|p| !p.is_empty() && !has_prefix_fold(p, &prefix))
        .collect::<Vec<_>>()
        .join("&")
}

/// Extract the format token from a decoded INSERT prefix; `values` when the
/// statement carries no FORMAT clause.
pub fn extract_format(query: &str) -> String {
    RE_GET_FORMAT
        .captures(query)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| FORMAT_VALUES.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q_TITLE: &str = "INSERT INTO table3 (c1, c2, c3) FORMAT TabSeparated";
    const Q_CONTENT: &str = "v11\tv12\tv13\nv21\tv22\tv23";
    const Q_VALUES_TITLE: &str = "INSERT INTO table3 (c1, c2, c3) Values";
    const Q_VALUES_TITLE_UPPER: &str = "INSERT INTO table3 (c1, c2, c3) VALUES";
    const Q_VALUES_CONTENT: &str = "(v11,v12,v13),(v21,v22,v23)";
    const Q_SELECT: &str = "SELECT 1";
    const Q_PARAMS: &str = "user=user&password=111";
    const BAD_ESC_QUERY: &str = "query=INSERT %zdwfr";

    fn esc(s: &str) -> String {
        query_escape(s)
    }

    #[test]
    fn unescape_rejects_malformed() {
        assert_eq!(query_unescape("a%2Cb"), Some("a,b".to_string()));
        assert_eq!(query_unescape("a+b"), Some("a b".to_string()));
        assert_eq!(query_unescape("%zd"), None);
        assert_eq!(query_unescape("%2"), None);
    }

    #[test]
    fn parse_query_body_only() {
        let (params, content, insert) =
            parse_query("", &format!("{} {}", Q_TITLE, Q_CONTENT));
        assert_eq!(params, format!("query={}", esc(Q_TITLE)));
        assert_eq!(content, Q_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_s2_canonical() {
        let (params, content, insert) = parse_query(
            "",
            "INSERT INTO t (a,b,c) FORMAT TabSeparated\nv1\tv2\tv3",
        );
        assert_eq!(
            params,
            "query=INSERT+INTO+t+%28a%2Cb%2Cc%29+FORMAT+TabSeparated"
        );
        assert_eq!(content, "v1\tv2\tv3");
        assert!(insert);
    }

    #[test]
    fn parse_query_params_and_body() {
        let (params, content, insert) =
            parse_query(Q_PARAMS, &format!("{} {}", Q_TITLE, Q_CONTENT));
        assert_eq!(params, format!("{}&query={}", Q_PARAMS, esc(Q_TITLE)));
        assert_eq!(content, Q_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_in_query_string() {
        let qs = format!("query={}", esc(Q_TITLE));
        let (params, content, insert) = parse_query(&qs, Q_CONTENT);
        assert_eq!(params, qs);
        assert_eq!(content, Q_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_with_other_params() {
        let qs = format!("{}&query={}", Q_PARAMS, esc(Q_TITLE));
        let (params, content, insert) = parse_query(&qs, Q_CONTENT);
        assert_eq!(params, qs);
        assert_eq!(content, Q_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_reorders_query_last() {
        let qs = format!("user=u&query={}&password=p", esc(Q_SELECT));
        let (params, content, insert) = parse_query(&qs, "");
        assert_eq!(params, format!("user=u&password=p&query={}", esc(Q_SELECT)));
        assert_eq!(content, "");
        assert!(!insert);
    }

    #[test]
    fn parse_query_select_passthrough() {
        let (params, content, insert) = parse_query(&format!("query={}", esc(Q_SELECT)), "");
        assert_eq!(params, format!("query={}", esc(Q_SELECT)));
        assert_eq!(content, "");
        assert!(!insert);

        let (params, content, insert) = parse_query("", Q_SELECT);
        assert_eq!(params, format!("query={}", esc(Q_SELECT)));
        assert_eq!(content, "");
        assert!(!insert);
    }

    #[test]
    fn parse_query_values_in_query_string() {
        let qs = format!(
            "query={}",
            esc(&format!("{} {}", Q_VALUES_TITLE, Q_VALUES_CONTENT))
        );
        let (params, content, insert) = parse_query(&qs, "");
        assert_eq!(params, format!("query={}", esc(Q_VALUES_TITLE)));
        assert_eq!(content, Q_VALUES_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_lowercase_variants() {
        let lower_title = Q_TITLE.to_lowercase();
        let (params, content, insert) =
            parse_query("", &format!("{} {}", lower_title, Q_CONTENT));
        assert_eq!(
            params.to_lowercase(),
            format!("query={}", esc(&lower_title)).to_lowercase()
        );
        assert_eq!(content, Q_CONTENT);
        assert!(insert);

        let lower_values = Q_VALUES_TITLE.to_lowercase();
        let (params, content, insert) =
            parse_query("", &format!("{} {}", lower_values, Q_VALUES_CONTENT));
        assert_eq!(
            params.to_lowercase(),
            format!("query={}", esc(&lower_values)).to_lowercase()
        );
        assert_eq!(content, Q_VALUES_CONTENT);
        assert!(insert);

        let (params, content, insert) = parse_query(
            "",
            &format!("{} {}", Q_VALUES_TITLE_UPPER, Q_VALUES_CONTENT),
        );
        assert_eq!(
            params.to_lowercase(),
            format!("query={}", esc(Q_VALUES_TITLE_UPPER)).to_lowercase()
        );
        assert_eq!(content, Q_VALUES_CONTENT);
        assert!(insert);
    }

    #[test]
    fn parse_query_bad_escape_passthrough() {
        let body = format!("{} {}", Q_VALUES_TITLE_UPPER, Q_VALUES_CONTENT);
        let (params, content, insert) = parse_query(BAD_ESC_QUERY, &body);
        assert!(!insert);
        assert_eq!(params, BAD_ESC_QUERY);
        assert_eq!(content, body);
    }

    // A quoted literal containing FORMAT after VALUES must not move the
    // split point.
    #[test]
    fn parse_query_format_inside_quotes() {
        let title = "INSERT INTO test (date, args) VALUES";
        let values = "('2019-06-13', 'query=select%20args%20from%20test%20group%20by%20date%20FORMAT%20JSON')";
        let (params, content, insert) = parse_query("", &format!("{} {}", title, values));
        assert_eq!(params, format!("query={}", esc(title)));
        assert_eq!(content, values);
        assert!(insert);

        let qs = format!("query={}", esc(&format!("{} {}", title, values)));
        let (params, content, insert) = parse_query(&qs, "");
        assert_eq!(params, format!("query={}", esc(title)));
        assert_eq!(content, values);
        assert!(insert);
    }

    #[test]
    fn split_statement_format_without_rows() {
        let (prefix, content) = split_statement("INSERT INTO t FORMAT RowBinary");
        assert_eq!(prefix, "INSERT INTO t FORMAT RowBinary");
        assert_eq!(content, "");
    }

    #[test]
    fn split_statement_semicolon_delimiter() {
        let (prefix, content) = split_statement("INSERT INTO t FORMAT JSONEachRow;{\"a\":1}");
        assert_eq!(prefix, "INSERT INTO t FORMAT JSONEachRow;");
        assert_eq!(content, "{\"a\":1}");
    }

    #[test]
    fn separate_query_splits_key() {
        let key = format!("{}&query={}", Q_PARAMS, esc(Q_SELECT));
        let (query, params) = separate_query(&key);
        assert_eq!(query, Q_SELECT);
        assert_eq!(params, Q_PARAMS);
    }

    #[test]
    fn strip_param_removes_component() {
        assert_eq!(
            strip_param("query_id=abc&user=u&query=SELECT+1", "query_id"),
            "user=u&query=SELECT+1"
        );
        assert_eq!(strip_param("query_id=abc", "query_id"), "");
        assert_eq!(strip_param("user=u", "query_id"), "user=u");
        assert_eq!(strip_param("", "query_id"), "");
    }

    #[test]
    fn extract_format_cases() {
        assert_eq!(extract_format(Q_TITLE), "TabSeparated");
        assert_eq!(extract_format(Q_VALUES_TITLE), FORMAT_VALUES);
        assert_eq!(extract_format("insert into t format RowBinary"), "RowBinary");
    }
}
