//! Request-phase enforcement: recover the client token from body or query,
//! compare it against the cookie token, and on failure apply the configured
//! action before the inner service ever runs.

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{
    header, request::Parts, uri::PathAndQuery, HeaderValue, Method, Request, Response,
    StatusCode, Uri,
};
use http_body::Body;
use http_body_util::{BodyExt, Limited};

use crate::{
    config::{Action, Config},
    error::Error,
    parse,
    token::{self, TOKEN_NAME},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of token validation for one request. Computed once, consumed by
/// [`decide`] and by the response phase's refresh logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The request is not subject to validation.
    NotApplicable,
    /// Client token and cookie token match.
    Passed,
    /// No token in the body or query (or the body was unreadable).
    FailedNoClientToken,
    /// The client sent a token but holds no cookie.
    FailedNoCookieToken,
    /// Both tokens present, not equal.
    FailedMismatch,
}

impl Outcome {
    pub(crate) fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedNoClientToken | Self::FailedNoCookieToken | Self::FailedMismatch
        )
    }
}

/// Marker inserted into synthetic responses so the response phase skips
/// token refresh and body rewriting for them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Rejected;

/// Determines whether the client-supplied token matches the cookie token.
///
/// POST requests must carry a form-encoded body holding the token field;
/// GET requests are validated through their query string only when the
/// configured path pattern matches. Everything else is out of scope.
pub(crate) fn validate(config: &Config, parts: &Parts, form_body: Option<&[u8]>) -> Outcome {
    if !config.enabled {
        return Outcome::NotApplicable;
    }

    let client_token = if parts.method == Method::POST {
        if !parse::is_form_content_type(&parts.headers) {
            return Outcome::FailedNoClientToken;
        }
        let Some(body) = form_body else {
            return Outcome::FailedNoClientToken;
        };
        match parse::parse_form_body(body).remove(TOKEN_NAME) {
            Some(token) => token,
            None => return Outcome::FailedNoClientToken,
        }
    } else if parts.method == Method::GET && get_validation_applies(config, &parts.uri) {
        match parse::parse_query(parts.uri.query().unwrap_or("")).remove(TOKEN_NAME) {
            Some(token) => token,
            None => return Outcome::FailedNoClientToken,
        }
    } else {
        return Outcome::NotApplicable;
    };

    let Some(cookie_token) = cookie_token(parts) else {
        return Outcome::FailedNoCookieToken;
    };

    if client_token == cookie_token {
        Outcome::Passed
    } else {
        Outcome::FailedMismatch
    }
}

fn get_validation_applies(config: &Config, uri: &Uri) -> bool {
    config
        .verify_get_for
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(uri.path()))
}

fn cookie_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|raw| token::extract(raw, TOKEN_NAME))
}

/// Concrete response action for a failed validation.
#[derive(Debug)]
pub(crate) struct Decision {
    pub(crate) continue_processing: bool,
    pub(crate) status: StatusCode,
    pub(crate) body: Option<String>,
    pub(crate) redirect_to: Option<String>,
}

/// Maps a failed outcome and the configured action to a [`Decision`]. A
/// redirect without a configured URI falls back to 403, as does any
/// unrecognized action.
pub(crate) fn decide(outcome: Outcome, config: &Config) -> Decision {
    debug_assert!(outcome.is_failure());

    match config.action {
        Action::Strip => Decision {
            continue_processing: true,
            status: StatusCode::OK,
            body: None,
            redirect_to: None,
        },
        Action::Redirect if !config.redirect_uri.is_empty() => Decision {
            continue_processing: false,
            status: StatusCode::FOUND,
            body: None,
            redirect_to: Some(config.redirect_uri.clone()),
        },
        Action::Message => Decision {
            continue_processing: false,
            status: StatusCode::OK,
            body: Some(format!("<h2>{}</h2>", config.custom_message)),
            redirect_to: None,
        },
        Action::InternalError => Decision {
            continue_processing: false,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: None,
            redirect_to: None,
        },
        _ => Decision {
            continue_processing: false,
            status: StatusCode::FORBIDDEN,
            body: None,
            redirect_to: None,
        },
    }
}

#[derive(Clone)]
pub struct GuardService<S> {
    inner: S,
}

impl<S> GuardService<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, ReqBody, ResBody> tower_service::Service<Request<ReqBody>> for GuardService<S>
where
    S: tower_service::Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Body + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: From<Bytes> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The instance that was polled ready does the work; a fresh clone
        // stays behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let config = match request.extensions().get::<Arc<Config>>().cloned() {
                Some(config) => config,
                None => return Error::make_layer_error(Error::ExtensionNotFound("Config")),
            };

            if !config.enabled {
                return inner.call(request).await;
            }

            let (parts, body) = request.into_parts();

            // The body is consumed at most once, and only up to its declared
            // length. A form POST without a declared length is treated as
            // carrying no token.
            let (form_bytes, body) =
                if parts.method == Method::POST && parse::is_form_content_type(&parts.headers) {
                    match declared_length(&parts.headers) {
                        Some(limit) => match Limited::new(body, limit).collect().await {
                            Ok(collected) => (Some(collected.to_bytes()), None),
                            Err(err) => {
                                return Error::make_layer_error(Error::BodyRead(err));
                            }
                        },
                        None => (None, Some(body)),
                    }
                } else {
                    (None, Some(body))
                };

            let outcome = validate(&config, &parts, form_bytes.as_deref());

            match outcome {
                Outcome::Passed | Outcome::NotApplicable => {
                    inner.call(reassemble(parts, form_bytes, body)).await
                }
                failed => {
                    tracing::warn!(
                        outcome = ?failed,
                        method = %parts.method,
                        path = %parts.uri.path(),
                        "token validation failed",
                    );

                    let decision = decide(failed, &config);
                    if decision.continue_processing {
                        inner.call(strip_request(parts, form_bytes, body)).await
                    } else {
                        Ok(rejection_response(decision))
                    }
                }
            }
        })
    }
}

fn declared_length(headers: &http::HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Puts a request back together after its body may have been buffered.
fn reassemble<B: From<Bytes>>(
    parts: Parts,
    form_bytes: Option<Bytes>,
    body: Option<B>,
) -> Request<B> {
    let body = match (form_bytes, body) {
        (Some(bytes), _) => B::from(bytes),
        (None, Some(body)) => body,
        (None, None) => B::from(Bytes::new()),
    };

    Request::from_parts(parts, body)
}

/// Rebuilds the request with every token-bearing parameter removed from the
/// query string and (for form POSTs) the body, then lets it through.
fn strip_request<B: From<Bytes>>(
    mut parts: Parts,
    form_bytes: Option<Bytes>,
    body: Option<B>,
) -> Request<B> {
    parts.uri = strip_uri(&parts.uri);

    match form_bytes {
        Some(bytes) => {
            let stripped = parse::strip_form_field(&bytes, TOKEN_NAME);
            parts.headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from(stripped.len() as u64),
            );
            Request::from_parts(parts, B::from(Bytes::from(stripped)))
        }
        None => reassemble(parts, None, body),
    }
}

fn strip_uri(uri: &Uri) -> Uri {
    let Some(query) = uri.query() else {
        return uri.clone();
    };

    let stripped = parse::strip_query_param(query, TOKEN_NAME);
    let path_and_query = if stripped.is_empty() {
        uri.path().to_owned()
    } else {
        format!("{}?{stripped}", uri.path())
    };

    let mut parts = uri.clone().into_parts();
    match PathAndQuery::from_maybe_shared(path_and_query) {
        Ok(path_and_query) => {
            parts.path_and_query = Some(path_and_query);
            Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
        }
        Err(_) => uri.clone(),
    }
}

fn rejection_response<B: From<Bytes>>(decision: Decision) -> Response<B> {
    let Decision {
        status,
        body,
        redirect_to,
        ..
    } = decision;

    let has_body = body.is_some();
    let mut response = Response::new(B::from(body.map(Bytes::from).unwrap_or_default()));
    *response.status_mut() = status;

    if has_body {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    }

    if let Some(uri) = redirect_to {
        match HeaderValue::from_str(&uri) {
            Ok(location) => {
                response.headers_mut().insert(header::LOCATION, location);
            }
            Err(_) => *response.status_mut() = StatusCode::FORBIDDEN,
        }
    }

    response.extensions_mut().insert(Rejected);

    response
}
