use regex::Regex;
use tower_cookies::cookie::SameSite;

pub(crate) const URI_MAX_LENGTH: usize = 200;
pub(crate) const MESSAGE_MAX_LENGTH: usize = 200;
pub(crate) const NOSCRIPT_MESSAGE_MAX_LENGTH: usize = 400;

const DEFAULT_TOKEN_LENGTH: usize = 15;
const DEFAULT_CUSTOM_MESSAGE: &str = "ACCESS FORBIDDEN BY OWASP CSRF_PROTECTOR!";
const DEFAULT_JS_ASSET_URI: &str = "http://localhost/csrfp_js/csrfprotector.js";
const DEFAULT_NOSCRIPT_MESSAGE: &str = "This site attempts to protect users against \
<a href=\"https://www.owasp.org/index.php/Cross-Site_Request_Forgery_%28CSRF%29\">\
Cross-Site Request Forgery</a> attacks. In order to do so, you must have JavaScript \
enabled in your web browser otherwise this site will fail to work correctly for you. \
See details of your web browser for how to enable JavaScript.";

/// Response taken when token validation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Action {
    /// Reject with 403.
    #[default]
    Forbidden,
    /// Remove the token-bearing parameters and let the request through.
    Strip,
    /// 302 to the configured redirect URI.
    Redirect,
    /// 200 with the configured message.
    Message,
    /// Reject with 500.
    InternalError,
}

/// Immutable per-process snapshot, built once by [`CsrfProtect`] and shared
/// read-only across all in-flight requests.
///
/// [`CsrfProtect`]: crate::CsrfProtect
#[derive(Clone)]
pub(crate) struct Config {
    pub(crate) enabled: bool,
    pub(crate) action: Action,
    pub(crate) redirect_uri: String,
    pub(crate) custom_message: String,
    pub(crate) js_asset_uri: String,
    pub(crate) token_length: usize,
    pub(crate) noscript_message: String,
    pub(crate) verify_get_for: Option<Regex>,
    pub(crate) http_only: bool,
    pub(crate) same_site: SameSite,
    pub(crate) secure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            action: Action::Forbidden,
            redirect_uri: String::new(),
            custom_message: DEFAULT_CUSTOM_MESSAGE.into(),
            js_asset_uri: DEFAULT_JS_ASSET_URI.into(),
            token_length: DEFAULT_TOKEN_LENGTH,
            noscript_message: DEFAULT_NOSCRIPT_MESSAGE.into(),
            verify_get_for: None,
            // The companion script reads the cookie from the document, so it
            // cannot be HttpOnly by default.
            http_only: false,
            same_site: SameSite::Lax,
            secure: false,
        }
    }
}

/// Truncates at a char boundary so oversized values can never overrun the
/// documented maximums. Mirrors the directive length caps of the original
/// module.
pub(crate) fn truncate_to(mut value: String, max: usize) -> String {
    if value.len() <= max {
        return value;
    }

    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);

    value
}
