//! Browser capability boundary.
//!
//! The verification pipeline only talks to the browser through these traits.
//! `playwright::PlaywrightBridge` is the production implementation; tests use
//! in-memory fakes.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::E2eResult;

/// Outcome of a top-level navigation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationResponse {
    /// HTTP status of the main document, if a response arrived
    pub status: Option<u16>,

    /// Raw `Retry-After` header value, if any
    pub retry_after: Option<String>,
}

impl NavigationResponse {
    pub fn ok(status: u16) -> Self {
        Self {
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }
}

/// Launches isolated execution contexts (own cookie/storage partition).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a fresh context with a single page.
    async fn new_page(&self) -> E2eResult<Box<dyn PageSession>>;

    /// Shut the browser down.
    async fn shutdown(&self) -> E2eResult<()>;
}

/// One page inside one isolated context.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate the main frame and wait for DOM content.
    async fn goto(&mut self, url: &str, timeout: Duration) -> E2eResult<NavigationResponse>;

    /// Evaluate a JavaScript function expression with one JSON argument.
    async fn evaluate(
        &mut self,
        function: &str,
        arg: serde_json::Value,
    ) -> E2eResult<serde_json::Value>;

    /// Evaluate with an explicit reply budget, for scripts that make network
    /// requests of their own.
    async fn evaluate_within(
        &mut self,
        function: &str,
        arg: serde_json::Value,
        timeout: Duration,
    ) -> E2eResult<serde_json::Value>;

    /// Inject a classic script into the current document.
    async fn add_script(&mut self, content: &str) -> E2eResult<()>;

    /// Wait for `selector` to be attached; `Ok(false)` when it never shows up.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> E2eResult<bool>;

    /// Click the first element matching `selector`.
    async fn click(&mut self, selector: &str) -> E2eResult<()>;

    /// Capture the viewport as PNG.
    async fn screenshot(&mut self, path: &Path) -> E2eResult<()>;

    /// Number of dialogs raised (and auto-dismissed) since the page opened.
    async fn dialog_count(&mut self) -> E2eResult<u32>;

    /// Drop cookies, HTTP cache and all site storage for `origin`.
    async fn clear_site_data(&mut self, origin: &str) -> E2eResult<()>;

    /// Toggle the HTTP cache for subsequent requests.
    async fn set_cache_enabled(&mut self, enabled: bool) -> E2eResult<()>;

    /// Block until the page is closed from outside, e.g. by hand in a headed
    /// browser.
    async fn wait_closed(&mut self) -> E2eResult<()>;

    /// Close the page and its context.
    async fn close(self: Box<Self>) -> E2eResult<()>;
}

/// Origin (`scheme://host[:port]`) of an absolute URL.
pub fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    if scheme.is_empty() || host.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme.to_lowercase(), host.to_lowercase()))
}

/// Host part of an absolute URL, without port.
pub fn host_of(url: &str) -> Option<String> {
    let origin = origin_of(url)?;
    let host = origin.split_once("://")?.1;
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    Some(host.split(':').next().unwrap_or(host).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://Dawn-Theme.myshopify.com/products/x?y=1").as_deref(),
            Some("https://dawn-theme.myshopify.com")
        );
        assert_eq!(
            origin_of("http://localhost:8080").as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("http://localhost:8080/x").as_deref(),
            Some("localhost")
        );
    }
}
