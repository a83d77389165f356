//! Fixed redirects and the plaintext to HTTPS upgrade.

use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};

/// 303 See Other to a fixed target.
pub fn redirect(target: &str) -> Response {
    Redirect::to(target).into_response()
}

/// 302 Found to the same host, path and query over HTTPS.
///
/// `host` must already be stripped of any port; the HTTPS port is appended
/// unless it is the default.
pub fn redirect_to_https(host: &str, uri: &Uri, https_port: u16) -> Response {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let https_url = if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    };

    tracing::debug!(from = %uri, to = %https_url, "Redirecting HTTP to HTTPS");

    (StatusCode::FOUND, [(header::LOCATION, https_url)]).into_response()
}
