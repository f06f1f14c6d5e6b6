use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tower_cookies::{Cookie, Cookies};

use crate::{config::Config, error::Error};

/// Cookie name and request field name, fixed by the csrfp protocol.
pub const TOKEN_NAME: &str = "csrfp_token";

const ALPHABET: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates an alphanumeric token of exactly `length` characters from the
/// OS entropy source.
///
/// Bytes are rejection-sampled so every character of the 62-letter alphabet
/// is equally likely. Fails with [`Error::EntropyUnavailable`] instead of
/// degrading to a predictable generator.
pub(crate) fn generate(length: usize) -> Result<String, Error> {
    debug_assert!(length >= 1);

    let mut token = String::with_capacity(length);
    let mut buf = [0u8; 64];

    while token.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|_| Error::EntropyUnavailable)?;

        for &byte in &buf {
            // 248 is the largest multiple of 62 that fits in a byte.
            if byte >= 248 {
                continue;
            }
            token.push(ALPHABET[(byte % 62) as usize] as char);
            if token.len() == length {
                break;
            }
        }
    }

    Ok(token)
}

/// Looks up a cookie by exact name in a raw `Cookie` header value.
///
/// Pairs are split on `;` and compared by full name, so a cookie whose name
/// merely contains `name` as a substring never matches.
pub(crate) fn extract(raw_cookie_header: &str, name: &str) -> Option<String> {
    Cookie::split_parse(raw_cookie_header.to_owned())
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value_trimmed().to_owned())
}

/// Serializes the token cookie with the configured attributes. Path is
/// always `/` so every request on the host carries it back.
pub(crate) fn build_cookie(config: &Config, value: String) -> Cookie<'static> {
    Cookie::build((TOKEN_NAME, value))
        .path("/")
        .http_only(config.http_only)
        .same_site(config.same_site)
        .secure(config.secure)
        .build()
}

/// Handle to the current request's token, available to handlers as a request
/// extension (and as an axum extractor with the `axum` feature).
#[derive(Clone)]
pub struct Token {
    pub(crate) config: Arc<Config>,
    pub(crate) cookies: Cookies,
}

impl Token {
    /// Returns the token currently held by the client.
    pub fn get(&self) -> Result<String, Error> {
        self.cookies
            .get(TOKEN_NAME)
            .map(|cookie| cookie.value().to_owned())
            .ok_or(Error::NoCookie)
    }

    /// Issues a fresh token immediately, replacing the cookie.
    pub fn refresh(&self) -> Result<String, Error> {
        let token = generate(self.config.token_length)?;
        self.cookies.add(build_cookie(&self.config, token.clone()));

        Ok(token)
    }
}
