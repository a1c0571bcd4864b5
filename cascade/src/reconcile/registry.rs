//! Clients for the external workflow registry.

use super::model::RemoteWorkflow;
use crate::errors::CascadeError;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Source of truth for externally registered workflows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
    /// Lists every workflow; the registry offers no entity filter.
    async fn list_workflows(&self) -> Result<Vec<RemoteWorkflow>, CascadeError>;
}

/// A fixed, replaceable workflow list.
#[derive(Debug, Default)]
pub struct StaticWorkflowRegistry {
    workflows: RwLock<Vec<RemoteWorkflow>>,
}

impl StaticWorkflowRegistry {
    /// Creates a registry serving `workflows`.
    #[must_use]
    pub fn new(workflows: Vec<RemoteWorkflow>) -> Self {
        Self {
            workflows: RwLock::new(workflows),
        }
    }

    /// Replaces the served list.
    pub fn replace(&self, workflows: Vec<RemoteWorkflow>) {
        *self.workflows.write() = workflows;
    }
}

#[async_trait]
impl WorkflowRegistry for StaticWorkflowRegistry {
    async fn list_workflows(&self) -> Result<Vec<RemoteWorkflow>, CascadeError> {
        Ok(self.workflows.read().clone())
    }
}

#[cfg(feature = "http-registry")]
pub use http::HttpWorkflowRegistry;

#[cfg(feature = "http-registry")]
mod http {
    use super::{RemoteWorkflow, WorkflowRegistry};
    use crate::errors::CascadeError;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::time::Duration;
    use tracing::debug;

    const API_KEY_HEADER: &str = "X-N8N-API-KEY";
    const PAGE_SIZE: u32 = 100;
    const MAX_PAGES: usize = 1_000;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WorkflowPage {
        #[serde(default)]
        data: Vec<RemoteWorkflow>,
        #[serde(default)]
        next_cursor: Option<String>,
    }

    /// REST client listing `GET {base}/api/v1/workflows` with cursor paging.
    #[derive(Debug, Clone)]
    pub struct HttpWorkflowRegistry {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    }

    impl HttpWorkflowRegistry {
        /// Creates a client; a trailing slash on `base_url` is ignored.
        #[must_use]
        pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default();
            Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key: api_key.into(),
            }
        }

        fn page_request(&self, cursor: Option<&str>) -> reqwest::RequestBuilder {
            let mut request = self
                .client
                .get(format!("{}/api/v1/workflows", self.base_url))
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("limit", PAGE_SIZE.to_string())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            request
        }

        fn unavailable(e: impl std::fmt::Display) -> CascadeError {
            CascadeError::DependencyUnavailable(format!("workflow registry: {e}"))
        }
    }

    #[async_trait]
    impl WorkflowRegistry for HttpWorkflowRegistry {
        async fn list_workflows(&self) -> Result<Vec<RemoteWorkflow>, CascadeError> {
            let mut workflows = Vec::new();
            let mut cursor: Option<String> = None;

            for _ in 0..MAX_PAGES {
                let page: WorkflowPage = self
                    .page_request(cursor.as_deref())
                    .send()
                    .await
                    .map_err(Self::unavailable)?
                    .error_for_status()
                    .map_err(Self::unavailable)?
                    .json()
                    .await
                    .map_err(Self::unavailable)?;

                debug!(count = page.data.len(), "Fetched workflow page");
                workflows.extend(page.data);

                match page.next_cursor {
                    Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                        cursor = Some(next);
                    }
                    _ => return Ok(workflows),
                }
            }

            Err(Self::unavailable(format!(
                "more than {MAX_PAGES} pages of workflows"
            )))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_page_request() {
            let registry =
                HttpWorkflowRegistry::new("https://n8n.example.com/", "key", Duration::from_secs(5));

            let first = registry.page_request(None).build().unwrap();
            assert_eq!(
                first.url().as_str(),
                "https://n8n.example.com/api/v1/workflows?limit=100"
            );
            assert_eq!(first.headers()[API_KEY_HEADER], "key");

            let next = registry.page_request(Some("a+b/c=")).build().unwrap();
            assert_eq!(
                next.url().query(),
                Some("limit=100&cursor=a%2Bb%2Fc%3D")
            );
        }

        #[test]
        fn test_page_deserialize() {
            let page: WorkflowPage = serde_json::from_str(
                r#"{"data":[{"id":"1","name":"a","active":true,"nodes":[]}],"nextCursor":null}"#,
            )
            .unwrap();
            assert_eq!(page.data.len(), 1);
            assert!(page.next_cursor.is_none());
        }
    }
}
