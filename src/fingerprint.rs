//! Request fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over canonical representations of
//! the request components, so that logically identical requests hash to
//! the same value regardless of query-parameter order, header casing,
//! or insertion order.

use crate::headers::canonicalize_headers;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Computes a deterministic fingerprint for a request.
///
/// Canonicalization, in order:
/// 1. Method: uppercase ASCII.
/// 2. Path: lowercase; one trailing `/` stripped unless the path is
///    exactly `/`. Percent-encoding is preserved as-is.
/// 3. Query: parsed as form-urlencoded (blank values and duplicate keys
///    preserved), sorted by `(key, value)`, re-encoded.
/// 4. Headers: restricted to `included_headers`, lowercased, trimmed,
///    serialized as a sorted compact JSON object.
/// 5. Body: SHA-256 hex of the raw bytes.
///
/// The five components are joined with `\n` and hashed once more;
/// the result is 64 lowercase hex characters.
pub fn compute_fingerprint(
    method: &str,
    path: &str,
    query_string: &str,
    headers: &[(String, String)],
    body: &[u8],
    included_headers: &[String],
) -> String {
    let canonical_method = method.to_ascii_uppercase();
    let canonical_path = canonicalize_path(path);
    let canonical_query = canonicalize_query(query_string);
    let canonical_headers = canonical_header_json(headers, included_headers);
    let body_digest = hex::encode(Sha256::digest(body));

    let composed = [
        canonical_method.as_str(),
        canonical_path.as_str(),
        canonical_query.as_str(),
        canonical_headers.as_str(),
        body_digest.as_str(),
    ]
    .join("\n");

    hex::encode(Sha256::digest(composed.as_bytes()))
}

/// Lowercases the path and strips a single trailing slash (the root
/// path `/` is left alone). An empty path canonicalizes to `/`.
fn canonicalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let lowered = path.to_ascii_lowercase();
    if lowered != "/" {
        if let Some(stripped) = lowered.strip_suffix('/') {
            return stripped.to_string();
        }
    }
    lowered
}

/// Parses the query string, sorts the decoded pairs by `(key, value)`,
/// and re-encodes them. Blank values survive as `key=`; duplicate keys
/// survive as repeated pairs.
fn canonicalize_query(query_string: &str) -> String {
    if query_string.trim().is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query_string.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Serializes the included headers as a JSON object with sorted keys
/// and compact separators, e.g. `{"content-length":"42"}`.
fn canonical_header_json(headers: &[(String, String)], included_headers: &[String]) -> String {
    let canonical: BTreeMap<String, String> = canonicalize_headers(headers, included_headers);
    // A string-to-string BTreeMap cannot fail to serialize.
    serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string())
}
