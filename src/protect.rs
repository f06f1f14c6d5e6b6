use std::{
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response};
use http_body::Body;
use regex::Regex;
use tower_cookies::{cookie::SameSite, CookieManager, Cookies};
use tower_layer::Layer;
use tower_service::Service;

use crate::{
    config::{self, Config},
    guard::{GuardService, Rejected},
    rewrite::{CsrfBody, Injector},
    token::{self, Token, TOKEN_NAME},
    Action, Error,
};

static X_PROTECTED_BY: HeaderName = HeaderName::from_static("x-protected-by");
const PROTECTED_BY_VALUE: &str = concat!("CSRFP ", env!("CARGO_PKG_VERSION"));

/// Layer enabling CSRF protection for every service behind it.
///
/// Doubles as the configuration builder; every request sees the snapshot
/// that existed when the layer was built.
#[derive(Clone)]
pub struct CsrfProtect {
    config: Config,
}

impl CsrfProtect {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Turns validation and rewriting off entirely while keeping the layer
    /// in place.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;

        self
    }

    /// Response taken on failed validation. Defaults to [`Action::Forbidden`].
    pub fn action(mut self, action: Action) -> Self {
        self.config.action = action;

        self
    }

    /// Target of [`Action::Redirect`]. Truncated to 200 bytes.
    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.config.redirect_uri =
            config::truncate_to(redirect_uri.into(), config::URI_MAX_LENGTH);

        self
    }

    /// Body of [`Action::Message`] responses. Truncated to 200 bytes.
    pub fn custom_message(mut self, custom_message: impl Into<String>) -> Self {
        self.config.custom_message =
            config::truncate_to(custom_message.into(), config::MESSAGE_MAX_LENGTH);

        self
    }

    /// URI of the client-side script injected before `</body>`. Truncated to
    /// 200 bytes; empty disables the script injection.
    pub fn js_asset_uri(mut self, js_asset_uri: impl Into<String>) -> Self {
        self.config.js_asset_uri =
            config::truncate_to(js_asset_uri.into(), config::URI_MAX_LENGTH);

        self
    }

    /// Token length in characters, minimum 1. Defaults to 15.
    pub fn token_length(mut self, token_length: usize) -> Self {
        self.config.token_length = token_length.max(1);

        self
    }

    /// Fallback message injected after `<body>` inside `<noscript>`.
    /// Truncated to 400 bytes; empty disables the noscript injection.
    pub fn noscript_message(mut self, noscript_message: impl Into<String>) -> Self {
        self.config.noscript_message = config::truncate_to(
            noscript_message.into(),
            config::NOSCRIPT_MESSAGE_MAX_LENGTH,
        );

        self
    }

    /// Path pattern for which GET requests are validated through their query
    /// string. GET validation is off without it.
    pub fn verify_get_for(mut self, pattern: Regex) -> Self {
        self.config.verify_get_for = Some(pattern);

        self
    }

    /// Marks the token cookie `HttpOnly`. Off by default: the companion
    /// script must be able to read the cookie from the document.
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.config.http_only = http_only;

        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.config.same_site = same_site;

        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.config.secure = secure;

        self
    }
}

impl Default for CsrfProtect {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CsrfProtect {
    type Service = CookieManager<ProtectService<GuardService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieManager::new(ProtectService {
            config: Arc::new(self.config.clone()),
            inner: GuardService::new(inner),
        })
    }
}

/// Response-phase half of the pipeline: issues the token cookie, stamps the
/// protection header, and arranges markup injection for accepted HTML
/// responses. Runs outside [`GuardService`] so rejections short-circuit
/// past it untouched.
#[derive(Clone)]
pub struct ProtectService<S> {
    config: Arc<Config>,
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ProtectService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
    S::Future: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
{
    type Response = Response<CsrfBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let config = self.config.clone();

        let cookies = match request
            .extensions()
            .get::<Cookies>()
            .cloned()
            .ok_or(Error::ExtensionNotFound("Cookies"))
        {
            Ok(cookies) => cookies,
            Err(err) => return Box::pin(async move { Error::make_layer_error(err) }),
        };

        // First contact: make sure the client leaves with a token even if
        // this request needs no validation.
        if config.enabled && cookies.get(TOKEN_NAME).is_none() {
            match token::generate(config.token_length) {
                Ok(fresh) => cookies.add(token::build_cookie(&config, fresh)),
                Err(err) => return Box::pin(async move { Error::make_layer_error(err) }),
            }
        }

        let token = Token {
            config: config.clone(),
            cookies: cookies.clone(),
        };

        request.extensions_mut().insert(config.clone());
        request.extensions_mut().insert(token);

        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;

            if !config.enabled || response.extensions().get::<Rejected>().is_some() {
                return Ok(response.map(CsrfBody::passthrough));
            }

            // Accepted: the token is refreshed on the way out.
            let fresh = match token::generate(config.token_length) {
                Ok(fresh) => fresh,
                Err(err) => return Error::make_layer_error(err),
            };
            cookies.add(token::build_cookie(&config, fresh));

            let (mut parts, body) = response.into_parts();
            parts
                .headers
                .insert(&X_PROTECTED_BY, HeaderValue::from_static(PROTECTED_BY_VALUE));

            let injector = Injector::new(&config);
            if is_html(&parts.headers) && !injector.is_noop() {
                // Injection changes the body length.
                parts.headers.remove(header::CONTENT_LENGTH);
                Ok(Response::from_parts(
                    parts,
                    CsrfBody::rewrite(body, injector),
                ))
            } else {
                Ok(Response::from_parts(parts, CsrfBody::passthrough(body)))
            }
        })
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.trim_start().as_bytes())
        .is_some_and(|ct| ct.len() >= 9 && ct[..9].eq_ignore_ascii_case(b"text/html"))
}
