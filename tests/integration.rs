use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use axum::{
    extract::RawQuery,
    response::Html,
    routing::{get, post},
    Router,
};
use axum_test::{TestServer, TestServerConfig};
use http::{header, HeaderName, HeaderValue, StatusCode};
use regex::Regex;
use tower_csrfp::{Action, CsrfProtect, Token};

const FORM: &str = "application/x-www-form-urlencoded";

fn cookie_header(token: &str) -> (HeaderName, HeaderValue) {
    (
        header::COOKIE,
        HeaderValue::from_str(&format!("csrfp_token={token}")).unwrap(),
    )
}

#[tokio::test]
async fn first_visit_issues_token_cookie() -> Result<()> {
    let app = Router::new()
        .route("/", get(|| async { "hello" }))
        .layer(CsrfProtect::new());

    let server = TestServer::new(app)?;
    let response = server.get("/").await;

    response.assert_status_ok();

    let cookie = response.cookie("csrfp_token");
    assert_eq!(cookie.value().len(), 15);
    assert!(cookie.value().bytes().all(|b| b.is_ascii_alphanumeric()));
    assert_eq!(cookie.path(), Some("/"));

    assert_eq!(
        response.headers().get("x-protected-by").unwrap(),
        &format!("CSRFP {}", env!("CARGO_PKG_VERSION"))
    );

    Ok(())
}

#[tokio::test]
async fn accepted_post_refreshes_token_and_injects_markup() -> Result<()> {
    let app = Router::new()
        .route(
            "/submit",
            post(|| async { Html("<html><body><p>done</p></body></html>") }),
        )
        .layer(
            CsrfProtect::new()
                .js_asset_uri("/static/csrfp.js")
                .noscript_message("Enable JavaScript"),
        );

    // Real HTTP transport so the request carries standard Content-Length framing.
    let config = TestServerConfig::builder().http_transport().build();
    let server = TestServer::new_with_config(app, config)?;
    let (name, value) = cookie_header("TOK1");
    let response = server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1&field=1".into())
        .await;

    response.assert_status_ok();
    assert!(response.headers().get("x-protected-by").is_some());

    let refreshed = response.cookie("csrfp_token");
    assert_eq!(refreshed.value().len(), 15);
    assert_ne!(refreshed.value(), "TOK1");

    let body = response.text();
    let body_open = body.find("<body>").unwrap();
    let noscript = body.find("<noscript>Enable JavaScript</noscript>").unwrap();
    let script = body
        .find("<script type=\"text/javascript\" src=\"/static/csrfp.js\"></script>")
        .unwrap();
    let body_close = body.find("</body>").unwrap();
    assert!(body_open < noscript);
    assert!(noscript < script);
    assert!(script < body_close);

    Ok(())
}

#[tokio::test]
async fn markup_is_injected_exactly_once() -> Result<()> {
    let app = Router::new()
        .route(
            "/page",
            post(|| async { Html("<html><body><p>x</p></body></html>") }),
        )
        .layer(CsrfProtect::new().noscript_message("fallback"));

    let config = TestServerConfig::builder().http_transport().build();
    let server = TestServer::new_with_config(app, config)?;
    let (name, value) = cookie_header("TOK1");
    let response = server
        .post("/page")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1".into())
        .await;

    response.assert_status_ok();
    let body = response.text();
    assert_eq!(body.matches("<noscript>").count(), 1);
    assert_eq!(body.matches("<script ").count(), 1);

    Ok(())
}

#[tokio::test]
async fn mismatched_token_is_forbidden_without_running_handler() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let app = Router::new()
        .route(
            "/submit",
            post(move || {
                let hits = handler_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "ran"
                }
            }),
        )
        .layer(CsrfProtect::new());

    let server = TestServer::new(app)?;
    let (name, value) = cookie_header("TOK2");
    let response = server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1&field=1".into())
        .await;

    response.assert_status_forbidden();
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Rejections neither refresh the token nor claim protection.
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert!(response.headers().get("x-protected-by").is_none());

    Ok(())
}

#[tokio::test]
async fn missing_client_token_is_forbidden() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|| async { "ran" }))
        .layer(CsrfProtect::new());

    let server = TestServer::new(app)?;

    // No token anywhere.
    let (name, value) = cookie_header("TOK1");
    server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("field=1".into())
        .await
        .assert_status_forbidden();

    // Wrong content type fails closed even with the right token in it.
    let (name, value) = cookie_header("TOK1");
    server
        .post("/submit")
        .add_header(name, value)
        .content_type("application/json")
        .bytes("csrfp_token=TOK1".into())
        .await
        .assert_status_forbidden();

    Ok(())
}

#[tokio::test]
async fn redirect_action_sends_client_to_error_uri() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|| async { "ran" }))
        .layer(
            CsrfProtect::new()
                .action(Action::Redirect)
                .redirect_uri("/error"),
        );

    let server = TestServer::new(app)?;
    let (name, value) = cookie_header("TOK2");
    let response = server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1&field=1".into())
        .await;

    response.assert_status(StatusCode::FOUND);
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/error");

    Ok(())
}

#[tokio::test]
async fn message_action_answers_with_custom_body() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|| async { "ran" }))
        .layer(
            CsrfProtect::new()
                .action(Action::Message)
                .custom_message("request blocked"),
        );

    let server = TestServer::new(app)?;
    let (name, value) = cookie_header("TOK2");
    let response = server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("field=1".into())
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), "<h2>request blocked</h2>");
    // Synthetic responses are not rewritten or refreshed.
    assert!(response.headers().get("x-protected-by").is_none());
    assert!(response.headers().get(header::SET_COOKIE).is_none());

    Ok(())
}

#[tokio::test]
async fn internal_error_action_rejects_with_500() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|| async { "ran" }))
        .layer(CsrfProtect::new().action(Action::InternalError));

    let server = TestServer::new(app)?;
    server
        .post("/submit")
        .content_type(FORM)
        .bytes("field=1".into())
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR);

    Ok(())
}

#[tokio::test]
async fn strip_action_removes_token_and_continues() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|body: String| async move { body }))
        .layer(CsrfProtect::new().action(Action::Strip));

    let config = TestServerConfig::builder().http_transport().build();
    let server = TestServer::new_with_config(app, config)?;
    let (name, value) = cookie_header("TOK2");
    let response = server
        .post("/submit")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1&field=1&other=2".into())
        .await;

    response.assert_status_ok();
    // The handler ran, but never saw the forged token.
    assert_eq!(response.text(), "field=1&other=2");
    // Stripped requests count as accepted: token refreshed, header stamped.
    assert!(response.headers().get("x-protected-by").is_some());
    assert!(response.cookies().get("csrfp_token").is_some());

    Ok(())
}

#[tokio::test]
async fn strip_action_cleans_query_string() -> Result<()> {
    let app = Router::new()
        .route(
            "/account",
            get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
        )
        .layer(
            CsrfProtect::new()
                .action(Action::Strip)
                .verify_get_for(Regex::new("^/account").unwrap()),
        );

    let server = TestServer::new(app)?;
    let (name, value) = cookie_header("TOK2");
    let response = server
        .get("/account?csrfp_token=TOK1&page=2")
        .add_header(name, value)
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), "page=2");

    Ok(())
}

#[tokio::test]
async fn get_validation_applies_only_to_matching_paths() -> Result<()> {
    let app = Router::new()
        .route("/account/settings", get(|| async { "settings" }))
        .route("/public", get(|| async { "public" }))
        .layer(CsrfProtect::new().verify_get_for(Regex::new("^/account").unwrap()));

    let server = TestServer::new(app)?;

    // Matching path without a token is rejected.
    let (name, value) = cookie_header("TOK1");
    server
        .get("/account/settings")
        .add_header(name, value)
        .await
        .assert_status_forbidden();

    // Matching path with the right token passes.
    let (name, value) = cookie_header("TOK1");
    server
        .get("/account/settings?csrfp_token=TOK1")
        .add_header(name, value)
        .await
        .assert_status_ok();

    // Non-matching paths are never validated.
    server.get("/public").await.assert_status_ok();

    Ok(())
}

#[tokio::test]
async fn non_html_responses_only_gain_headers() -> Result<()> {
    let payload = "{\"body\":\"</body>\"}";

    let app = Router::new()
        .route("/data", post(move || async move { payload }))
        .layer(CsrfProtect::new());

    let config = TestServerConfig::builder().http_transport().build();
    let server = TestServer::new_with_config(app, config)?;
    let (name, value) = cookie_header("TOK1");
    let response = server
        .post("/data")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1".into())
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), payload);
    assert!(response.headers().get("x-protected-by").is_some());
    assert!(response.cookies().get("csrfp_token").is_some());

    Ok(())
}

#[tokio::test]
async fn html_without_markers_degrades_to_cookie_refresh() -> Result<()> {
    let app = Router::new()
        .route("/fragment", post(|| async { Html("<div>partial</div>") }))
        .layer(CsrfProtect::new());

    let config = TestServerConfig::builder().http_transport().build();
    let server = TestServer::new_with_config(app, config)?;
    let (name, value) = cookie_header("TOK1");
    let response = server
        .post("/fragment")
        .add_header(name, value)
        .content_type(FORM)
        .bytes("csrfp_token=TOK1".into())
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), "<div>partial</div>");
    assert!(response.cookies().get("csrfp_token").is_some());

    Ok(())
}

#[tokio::test]
async fn disabled_layer_is_inert() -> Result<()> {
    let app = Router::new()
        .route("/submit", post(|| async { "ran" }))
        .layer(CsrfProtect::new().enabled(false));

    let server = TestServer::new(app)?;
    let response = server
        .post("/submit")
        .content_type(FORM)
        .bytes("field=1".into())
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), "ran");
    assert!(response.headers().get("x-protected-by").is_none());
    assert!(response.headers().get(header::SET_COOKIE).is_none());

    Ok(())
}

#[tokio::test]
async fn token_extractor_follows_cookie_lifecycle() -> Result<()> {
    async fn show(token: Token) -> Result<String, StatusCode> {
        token.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    async fn rotate(token: Token) -> Result<String, StatusCode> {
        token.refresh().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    let app = Router::new()
        .route("/token", get(show))
        .route("/rotate", get(rotate))
        .layer(CsrfProtect::new());

    let config = TestServerConfig::builder().save_cookies().build();
    let server = TestServer::new_with_config(app, config)?;

    // The handler sees the token created on first contact.
    let shown = server.get("/token").await.text();
    assert_eq!(shown.len(), 15);

    // A manual refresh hands back the value the client will hold next.
    let rotated = server.get("/rotate").await;
    rotated.assert_status_ok();
    assert!(rotated.cookies().get("csrfp_token").is_some());

    Ok(())
}
