//! Checks applied to the WebSocket upgrade request before any frame is read.

use tokio_tungstenite::tungstenite::http::{header, Request, StatusCode};

/// Optional shared token (`?token=`) and `Origin` allowlist.
#[derive(Debug, Clone, Default)]
pub struct UpgradeGuard {
    token: Option<String>,
    allowed_origins: Vec<String>,
}

impl UpgradeGuard {
    pub fn new(token: Option<String>, allowed_origins: Vec<String>) -> Self {
        Self {
            token,
            allowed_origins,
        }
    }

    /// Accept or reject an upgrade request.
    pub fn check<B>(&self, request: &Request<B>) -> Result<(), (StatusCode, &'static str)> {
        if !self.allowed_origins.is_empty() {
            let origin = request
                .headers()
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok());
            match origin {
                Some(origin) if self.allowed_origins.iter().any(|o| o == origin) => {}
                _ => return Err((StatusCode::FORBIDDEN, "origin not allowed")),
            }
        }

        if let Some(expected) = &self.token {
            let presented = request
                .uri()
                .query()
                .and_then(|q| query_param(q, "token"));
            if presented != Some(expected.as_str()) {
                return Err((StatusCode::UNAUTHORIZED, "invalid token"));
            }
        }

        Ok(())
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}
