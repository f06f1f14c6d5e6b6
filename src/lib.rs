//! Tower middleware rendition of the OWASP CSRF Protector apache module.
//!
//! ## Overview
//!
//! This crate mitigates CSRF with the double-submit cookie pattern: the
//! server hands the client a random token in the `csrfp_token` cookie, and
//! every state-changing request must echo that token back in its body (or,
//! optionally, its query string). An attacker forging a cross-origin
//! request cannot read the cookie, so they cannot produce a matching value.
//!
//! ### How it works
//!
//! - **Request phase**: for POST requests with a form-encoded body (and for
//!   GET requests whose path matches [`CsrfProtect::verify_get_for`]), the
//!   token recovered from the request is compared against the cookie token.
//!   On mismatch the configured [`Action`] decides the response: reject
//!   with 403 (default) or 500, redirect, answer with a custom message, or
//!   strip the token parameters and let the request through.
//! - **Response phase**: accepted responses get a freshly generated token
//!   cookie and an `X-Protected-By` header. HTML responses additionally get
//!   an injected `<noscript>` fallback right after `<body>` plus a reference
//!   to the client-side script right before `</body>`. The script keeps
//!   submitted forms in sync with the rotating cookie. Injection happens on
//!   the streamed body without buffering it.
//!
//! Tokens are plain random alphanumeric strings from the OS entropy source;
//! there is no signing and no server-side state beyond the cookie itself.
//!
//! ## Usage
//!
//! ### With [`axum`][crate-axum]
//!
//! ```rust, no_run
//! use std::net::SocketAddr;
//!
//! use axum::{routing::{get, post}, Router};
//! use tower_csrfp::{CsrfProtect, Token};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::new()
//!         .route("/", get(index))
//!         .route("/submit", post(|| async { "ok" }))
//!         .layer(CsrfProtect::new().js_asset_uri("/static/csrfp.js"));
//!
//!     let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
//!     let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
//!
//!     axum::serve(listener, app.into_make_service())
//!         .await
//!         .unwrap();
//! }
//!
//! async fn index(token: Token) -> String {
//!     // Embed the current token in a form, or let the injected script
//!     // attach it at submit time.
//!     format!("current token: {}", token.get().unwrap_or_default())
//! }
//! ```
//!
//! [crate-axum]: https://github.com/tokio-rs/axum

pub use config::Action;
pub use error::Error;
pub use guard::GuardService;
pub use protect::{CsrfProtect, ProtectService};
pub use rewrite::CsrfBody;
pub use token::{Token, TOKEN_NAME};
pub use tower_cookies::cookie::SameSite;

mod config;
mod error;
mod guard;
mod parse;
mod protect;
mod rewrite;
mod token;

#[cfg(feature = "axum")]
mod extract;
