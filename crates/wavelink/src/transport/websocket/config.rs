/// Configuration for the WebSocket carrier.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// The WebSocket URL or base URL
    pub url: String,
    /// Optional path suffix (e.g., "/link/session123")
    pub path: Option<String>,
    /// Whether to use TLS (wss:// vs ws://)
    pub use_tls: bool,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        // Auto-detect TLS based on URL
        let use_tls = url.starts_with("wss://")
            || (!url.starts_with("ws://")
                && !url.contains("127.0.0.1")
                && !url.contains("localhost"));

        Self {
            url,
            path: None,
            use_tls,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Build the full WebSocket URL
    pub fn build_url(&self) -> String {
        let mut url = self.url.clone();

        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            url = if self.use_tls {
                format!("wss://{}", url)
            } else {
                format!("ws://{}", url)
            };
        }

        // Normalize localhost to avoid IPv6 issues
        if url.contains("localhost") {
            url = url.replace("localhost", "127.0.0.1");
        }

        if let Some(ref path) = self.path {
            if !url.ends_with('/') && !path.starts_with('/') {
                url.push('/');
            }
            url.push_str(path);
        }

        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_a_scheme() {
        let config = WebSocketConfig::new("example.com:4400");
        assert!(config.use_tls);
        assert_eq!(config.build_url(), "wss://example.com:4400");
    }

    #[test]
    fn localhost_is_plaintext_and_normalized() {
        let config = WebSocketConfig::new("localhost:4400").with_path("link");
        assert!(!config.use_tls);
        assert_eq!(config.build_url(), "ws://127.0.0.1:4400/link");
    }

    #[test]
    fn explicit_scheme_wins() {
        let config = WebSocketConfig::new("ws://example.com").with_tls(false);
        assert_eq!(config.build_url(), "ws://example.com");
    }
}
