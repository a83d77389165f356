//! Static file serving confined to a configured root.
//!
//! The request path is decoded and cleaned lexically before it touches the
//! filesystem. Paths that would climb above the root, and paths that do not
//! name an existing file, are answered with the configured not-found page.

use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::config::StaticAction;

use super::status_response;

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index: String,
    not_found: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Target {
    File(PathBuf),
    NotFound,
}

impl StaticFiles {
    pub fn new(action: &StaticAction) -> Self {
        let root = clean(&action.dir);
        let not_found = root.join(&action.not_found);
        Self {
            root,
            index: action.index.clone(),
            not_found,
        }
    }

    pub async fn serve(&self, request: Request) -> Response {
        match self.resolve(request.uri().path()).await {
            Target::File(path) => serve_file(path, request).await,
            Target::NotFound => {
                if !is_file(&self.not_found).await {
                    return status_response(StatusCode::NOT_FOUND);
                }
                // Range and validators belong to the missing URL, not the page.
                let method = if request.method() == Method::HEAD {
                    Method::HEAD
                } else {
                    Method::GET
                };
                let page = Request::builder()
                    .method(method)
                    .uri(request.uri().clone())
                    .body(Body::empty())
                    .unwrap_or_else(|_| Request::new(Body::empty()));
                let mut response = serve_file(self.not_found.clone(), page).await;
                *response.status_mut() = StatusCode::NOT_FOUND;
                response.headers_mut().remove(header::LAST_MODIFIED);
                response
            }
        }
    }

    async fn resolve(&self, request_path: &str) -> Target {
        let Ok(decoded) = urlencoding::decode(request_path) else {
            return Target::NotFound;
        };
        let Some(relative) = confine(&decoded) else {
            tracing::debug!(path = %request_path, "Rejected path outside static root");
            return Target::NotFound;
        };

        let mut path = self.root.join(relative);
        if is_dir(&path).await {
            path.push(&self.index);
        }
        if is_file(&path).await {
            Target::File(path)
        } else {
            Target::NotFound
        }
    }
}

/// Clean a URL path into a relative filesystem path. `None` if `..` would
/// leave the root.
fn confine(path: &str) -> Option<PathBuf> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s if s.contains('\0') => return None,
            s => segments.push(s),
        }
    }
    Some(segments.iter().collect())
}

/// Lexical clean of the configured root, so `./www` and `www/.` compare equal.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn serve_file(path: PathBuf, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}
