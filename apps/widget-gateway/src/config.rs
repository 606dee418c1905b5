//! Environment-driven gateway configuration.

use std::net::SocketAddr;

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::{Any, CorsLayer};

use crate::WidgetEntry;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub widgets: Vec<WidgetEntry>,
    pub greeting: Option<String>,
    pub cors_origins: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let addr = std::env::var("WIDGET_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8090".into())
            .parse::<SocketAddr>()?;

        let inbox_name =
            std::env::var("WIDGET_INBOX_NAME").unwrap_or_else(|_| "Support".into());
        let welcome_title =
            std::env::var("WIDGET_WELCOME_TITLE").unwrap_or_else(|_| "Hi there 👋".into());
        let welcome_tagline = std::env::var("WIDGET_WELCOME_TAGLINE")
            .unwrap_or_else(|_| "We usually reply within a few minutes.".into());

        let widgets = std::env::var("WIDGET_TOKENS")
            .unwrap_or_else(|_| "dev-widget-token".into())
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| WidgetEntry {
                token: token.to_string(),
                inbox_name: inbox_name.clone(),
                welcome_title: welcome_title.clone(),
                welcome_tagline: welcome_tagline.clone(),
            })
            .collect();

        let greeting = std::env::var("WIDGET_GREETING")
            .ok()
            .filter(|greeting| !greeting.trim().is_empty());

        let cors_origins = std::env::var("WIDGET_CORS_ALLOWED")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            addr,
            widgets,
            greeting,
            cors_origins,
        })
    }
}

/// CORS for the embeddable widget: `GET, POST, OPTIONS` from the configured
/// origins, or any origin when none are pinned.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_origins_are_parsed() {
        let layer = cors_layer(&["https://shop.example.com".to_string()]);
        // CorsLayer is opaque; building it without panicking is the contract.
        let _ = layer;
    }

    #[test]
    fn empty_origin_list_allows_any() {
        let _ = cors_layer(&[]);
    }
}
