use std::time::Duration;

use tracing::{instrument, warn};
use uuid::Uuid;

/// Client for the content service that owns the articles a user wrote.
///
/// Failures never fail the caller: a user is still returned, with no contents.
pub struct ContentClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl ContentClient {
    pub fn new(base_url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        })
    }

    /// A client that always returns no contents.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
        }
    }

    fn author_url(&self, author: Uuid) -> Option<String> {
        self.base_url
            .as_ref()
            .map(|base| format!("{base}/v1/contents/author/{author}"))
    }

    #[instrument(skip(self))]
    pub async fn by_author(&self, author: Uuid) -> Vec<serde_json::Value> {
        let Some(url) = self.author_url(author) else {
            return Vec::new();
        };

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "content service unreachable");
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "content service returned error status");
            return Vec::new();
        }
        match response.json::<Vec<serde_json::Value>>().await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "content service response unreadable");
                Vec::new()
            }
        }
    }
}
