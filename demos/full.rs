use std::net::SocketAddr;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use http::{header, StatusCode};
use maud::{html, Markup};
use tower_csrfp::{CsrfProtect, Token};

// Minimal stand-in for the OWASP companion script: copies the token cookie
// into a hidden field on every form submission.
const CSRFP_JS: &str = r#"
document.addEventListener("submit", function (event) {
    var form = event.target;
    var match = document.cookie.match(/(?:^|;\s*)csrfp_token=([^;]*)/);
    if (!match) { return; }

    var input = form.querySelector("input[name='csrfp_token']");
    if (!input) {
        input = document.createElement("input");
        input.type = "hidden";
        input.name = "csrfp_token";
        form.appendChild(input);
    }
    input.value = match[1];
});
"#;

#[tokio::main]
async fn main() {
    let app = Router::new()
        .route("/", get(root))
        .route("/submit", post(submit))
        .layer(CsrfProtect::new().js_asset_uri("/static/csrfp.js"))
        .route("/static/csrfp.js", get(script));

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    axum::serve(listener, app.into_make_service())
        .await
        .unwrap();
}

async fn root(token: Token) -> Result<Markup, StatusCode> {
    let token = token.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(html! {
        html {
            head {
                link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/@picocss/pico@2/css/pico.min.css";
            }

            body {
                main class="container" {
                    p { mark { "Open the Network tab in your dev console." } }
                    p { small { kbd { (token) } } }

                    form method="post" action="/submit" {
                        label for="hotdogs" { "How do you like your hotdogs?" }

                        select name="hotdogs" value="ketchup" {
                            option value="ketchup" { "Ketchup" }
                            option value="more-ketchup" { "More ketchup" }
                        }

                        // The injected script fills in the token at submit
                        // time.
                        button type="submit" { "Submit" }
                    }

                    p {
                        small {
                            "To see a rejection, replay the submission from "
                            "curl without the cookie."
                        }
                    }
                }
            }
        }
    })
}

async fn submit(body: String) -> (StatusCode, String) {
    (StatusCode::OK, format!("Received: {body}"))
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript")], CSRFP_JS)
}
