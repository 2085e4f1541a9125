//! URL normalization helpers.
//!
//! Candidate uniqueness per (cycle, canonical URL) depends on this
//! canonical form, so the rules here are part of the dedup contract.

use anyhow::{Context, Result};
use url::Url;

const TRACKING_PARAM_PREFIXES: [&str; 1] = ["utm_"];
const TRACKING_PARAMS: [&str; 6] = ["fbclid", "gclid", "igshid", "mc_cid", "mc_eid", "ref_src"];

/// Canonicalize a URL: lowercase scheme and host, strip a leading `www.`,
/// drop tracking query params, sort the remaining pairs, trim the trailing
/// slash from the path, drop fragments.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim()).with_context(|| format!("invalid url: {raw}"))?;

    let scheme = parsed.scheme().to_ascii_lowercase();
    let mut host = parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .unwrap_or_default();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }

    let mut query_items: Vec<(String, String)> = Vec::new();
    for (key, value) in parsed.query_pairs() {
        if value.is_empty() {
            continue;
        }
        let key_lower = key.to_ascii_lowercase();
        if TRACKING_PARAMS.contains(&key_lower.as_str()) {
            continue;
        }
        if TRACKING_PARAM_PREFIXES
            .iter()
            .any(|prefix| key_lower.starts_with(prefix))
        {
            continue;
        }
        query_items.push((key.into_owned(), value.into_owned()));
    }
    query_items.sort();

    let path = match parsed.path().trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    let mut canonical = format!("{scheme}://{host}{path}");
    if let Some(port) = parsed.port() {
        canonical = format!("{scheme}://{host}:{port}{path}");
    }
    if !query_items.is_empty() {
        let query = query_items
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        canonical.push('?');
        canonical.push_str(&query);
    }
    Ok(canonical)
}

/// Extract the host of a URL, without a leading `www.`.
pub fn extract_domain(raw: &str) -> String {
    let host = Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_params_and_www() {
        let canonical =
            canonicalize_url("https://www.Example.com/a/?utm_source=x&fbclid=1&b=2").unwrap();
        assert_eq!(canonical, "https://example.com/a?b=2");
    }

    #[test]
    fn same_page_different_tracking_collapses() {
        let a = canonicalize_url("https://news.site.com/alpha?utm_campaign=test").unwrap();
        let b = canonicalize_url("https://news.site.com/alpha?utm_source=abc").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sorts_query_pairs() {
        let canonical = canonicalize_url("https://example.com/p?z=1&a=2").unwrap();
        assert_eq!(canonical, "https://example.com/p?a=2&z=1");
    }

    #[test]
    fn bare_host_keeps_root_path() {
        assert_eq!(
            canonicalize_url("https://example.com").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(extract_domain("https://www.ft.com/content/x"), "ft.com");
        assert_eq!(extract_domain("not a url"), "");
    }
}
