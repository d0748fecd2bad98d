use super::RootsHandler;
use crate::error::{McpError, McpResult};
use crate::schema::{ListRootsResult, Root};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use url::Url;

/// Application-configured file roots.
///
/// Entries that are not `file:///` URIs are dropped with a warning each time
/// the list is served. If every configured entry is dropped the request fails
/// with invalid params; an empty configuration yields an empty list.
#[derive(Debug, Clone, Default)]
pub struct StaticRoots {
    roots: Arc<RwLock<Vec<String>>>,
}

impl StaticRoots {
    pub fn new(roots: Vec<String>) -> Self {
        Self {
            roots: Arc::new(RwLock::new(roots)),
        }
    }

    /// Replace the configured roots. Follow with
    /// `SessionGroup::notify_roots_changed` so servers re-query.
    pub fn set(&self, roots: Vec<String>) {
        *self.roots.write().unwrap_or_else(|e| e.into_inner()) = roots;
    }

    pub fn configured(&self) -> Vec<String> {
        self.roots.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn is_file_root(candidate: &str) -> bool {
    candidate.starts_with("file:///")
        && Url::parse(candidate).is_ok_and(|url| url.scheme() == "file")
}

#[async_trait]
impl RootsHandler for StaticRoots {
    async fn list_roots(&self) -> McpResult<ListRootsResult> {
        let configured = self.configured();
        let mut roots = Vec::with_capacity(configured.len());

        for candidate in &configured {
            if is_file_root(candidate) {
                roots.push(Root {
                    uri: candidate.clone(),
                    name: None,
                });
            } else {
                tracing::warn!(root = %candidate, "Root is not a file:/// URI, ignoring");
            }
        }

        if roots.is_empty() && !configured.is_empty() {
            return Err(McpError::Protocol("No valid file roots provided".into()));
        }
        Ok(ListRootsResult { roots })
    }
}
