//! Header filtering and annotation helpers.
//!
//! Headers flow through the middleware as `(name, value)` pairs with
//! lowercased names, which keeps this module independent of any HTTP
//! framework and preserves multi-valued header order.

use std::collections::BTreeMap;

/// Hop-by-hop and volatile headers stripped from replayed responses.
pub const VOLATILE_HEADERS: &[&str] = &[
    "date",
    "server",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "trailer",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Annotation header marking a response as served from the record store.
pub const IDEMPOTENT_REPLAY: &str = "idempotent-replay";

/// Annotation header echoing the key a response was mediated under.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Drops volatile headers from a stored response, case-insensitively.
/// `Set-Cookie` is additionally dropped when `strip_set_cookie` is on.
pub fn filter_response_headers(
    headers: &[(String, String)],
    strip_set_cookie: bool,
) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            if VOLATILE_HEADERS.contains(&lowered.as_str()) {
                return false;
            }
            !(strip_set_cookie && lowered == "set-cookie")
        })
        .cloned()
        .collect()
}

/// Appends the idempotency annotations: the key on every mediated
/// response, the replay flag only on replays.
pub fn add_replay_headers(
    mut headers: Vec<(String, String)>,
    key: &str,
    is_replay: bool,
) -> Vec<(String, String)> {
    headers.retain(|(name, _)| {
        let lowered = name.to_ascii_lowercase();
        lowered != IDEMPOTENT_REPLAY && lowered != IDEMPOTENCY_KEY
    });
    if is_replay {
        headers.push((IDEMPOTENT_REPLAY.to_string(), "true".to_string()));
    }
    headers.push((IDEMPOTENCY_KEY.to_string(), key.to_string()));
    headers
}

/// Lowercases names, trims values, and restricts to `included` names
/// (case-insensitive). Later occurrences of a name win, matching how
/// single-valued request headers are read.
pub fn canonicalize_headers(
    headers: &[(String, String)],
    included: &[String],
) -> BTreeMap<String, String> {
    let included_lower: Vec<String> = included
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();

    let mut canonical = BTreeMap::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if included_lower.contains(&lowered) {
            canonical.insert(lowered, value.trim().to_string());
        }
    }
    canonical
}

/// Case-insensitive single-header lookup; first match wins.
pub fn get_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
