//! Query-string encoding
//!
//! Keys and values are percent-encoded with uppercase hex; only
//! `A-Z a-z 0-9 - _ .` pass through unchanged. Compared with classic form
//! encoding this means a space becomes `%20` (never `+`), and `*`, `~` and `/`
//! become `%2A`, `%7E` and `%2F`, which is what request-signing APIs expect.

use thiserror::Error;

/// Hex lookup table for percent-encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),
}

/// Encode a parameter map as `key1=val1&key2=val2`, in the map's iteration order
///
/// Only UTF-8 is supported as `charset`.
pub fn encode<'a, I, K, V>(params: I, charset: &str) -> Result<String, QueryError>
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: AsRef<str> + ?Sized + 'a,
    V: AsRef<str> + ?Sized + 'a,
{
    if !is_utf8(charset) {
        return Err(QueryError::UnsupportedCharset(charset.to_string()));
    }

    Ok(encode_pairs(
        params
            .into_iter()
            .map(|(k, v)| (k.as_ref(), Some(v.as_ref()))),
    ))
}

/// Encode pairs whose value may be absent; an absent value yields the bare key
pub fn encode_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut query = String::new();
    for (key, value) in pairs {
        if !query.is_empty() {
            query.push('&');
        }
        url_encode_into(&mut query, key);
        if let Some(value) = value {
            query.push('=');
            url_encode_into(&mut query, value);
        }
    }
    query
}

/// Percent-encode a single key or value
pub fn url_encode(s: &str) -> String {
    let mut buf = String::with_capacity(s.len() + 16);
    url_encode_into(&mut buf, s);
    buf
}

/// Writes directly into the target buffer
fn url_encode_into(buf: &mut String, s: &str) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                buf.push(byte as char);
            }
            _ => {
                buf.push('%');
                buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
}

fn is_utf8(charset: &str) -> bool {
    charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8")
}
