//! Decoding of the two places a client can present its token: an
//! `application/x-www-form-urlencoded` POST body and the request query
//! string.
//!
//! The two parsers deliberately resolve duplicate keys differently (body:
//! last occurrence wins, query: first occurrence wins) and treat a segment
//! without `=` differently (body: skipped, query: key with empty value).
//! Both quirks are inherited, documented behavior of the original module.

use std::collections::HashMap;

use http::{header, HeaderMap};
use percent_encoding::{percent_decode, percent_decode_str};

pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Whether the request declares a form-encoded body. Anything else (missing
/// header included) means the body is never read.
pub(crate) fn is_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

/// Decodes a form-encoded body into a field map. Malformed segments (no `=`,
/// empty key) are skipped, never fatal. A later duplicate key overwrites an
/// earlier one.
pub(crate) fn parse_form_body(body: &[u8]) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for segment in body.split(|&b| b == b'&') {
        let Some(eq) = segment.iter().position(|&b| b == b'=') else {
            continue;
        };
        let key = form_decode(&segment[..eq]);
        if key.is_empty() {
            continue;
        }
        fields.insert(key, form_decode(&segment[eq + 1..]));
    }

    fields
}

/// Decodes a raw query string into a parameter map. A segment without `=`
/// becomes a key with an empty value. The first occurrence of a duplicate
/// key is retained.
pub(crate) fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();

    for segment in raw.split('&') {
        let (key, value) = match segment.split_once('=') {
            Some((key, value)) => (key, value),
            None => (segment, ""),
        };
        let key = percent_decode_str(key).decode_utf8_lossy().into_owned();
        if key.is_empty() {
            continue;
        }
        pairs
            .entry(key)
            .or_insert_with(|| percent_decode_str(value).decode_utf8_lossy().into_owned());
    }

    pairs
}

/// Removes every body segment whose decoded key equals `name`, keeping the
/// remaining segments byte-for-byte as the client sent them.
pub(crate) fn strip_form_field(body: &[u8], name: &str) -> Vec<u8> {
    body.split(|&b| b == b'&')
        .filter(|segment| match segment.iter().position(|&b| b == b'=') {
            Some(eq) => form_decode(&segment[..eq]) != name,
            None => true,
        })
        .collect::<Vec<_>>()
        .join(&b'&')
}

/// Query-string counterpart of [`strip_form_field`].
pub(crate) fn strip_query_param(raw: &str, name: &str) -> String {
    raw.split('&')
        .filter(|segment| {
            let key = match segment.split_once('=') {
                Some((key, _)) => key,
                None => segment,
            };
            percent_decode_str(key).decode_utf8_lossy() != name
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-decoding plus `+` as space, per the form encoding rules.
fn form_decode(bytes: &[u8]) -> String {
    let unplussed: Vec<u8> = bytes
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();

    percent_decode(&unplussed).decode_utf8_lossy().into_owned()
}
