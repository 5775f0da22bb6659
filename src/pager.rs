//! Wraps a [`ListWatcher`]'s list capability with optional client-side paging
//! and fallback-to-full-list on an expired continuation token.
//!
//! Repeatedly lists with a growing continuation token until the server stops
//! returning one.

use crate::listwatcher::{
    ErrorClassifier, ListError, ListMetadata, ListOptions, ListResponse, ListWatcher,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    List(#[from] ListError),
}

#[derive(Debug, Clone, Copy)]
pub struct PagerConfig {
    /// Page size to request; `0` means "no client-side paging".
    pub page_size: i64,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self { page_size: 500 }
    }
}

pub struct Pager<'a> {
    list_watcher: &'a dyn ListWatcher,
    classifier: &'a dyn ErrorClassifier,
    config: PagerConfig,
}

impl<'a> Pager<'a> {
    #[must_use]
    pub fn new(list_watcher: &'a dyn ListWatcher, classifier: &'a dyn ErrorClassifier, config: PagerConfig) -> Self {
        Self {
            list_watcher,
            classifier,
            config,
        }
    }

    /// Performs a (possibly multi-page) list at `resource_version`.
    pub async fn list(
        &self,
        resource_version: &str,
        cancel: &CancellationToken,
    ) -> Result<ListResponse, Error> {
        if self.config.page_size == 0 {
            return self.single_unpaginated_list(resource_version, cancel).await;
        }

        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut last_rv = String::new();
        let mut pages = 0u32;

        loop {
            let opts = ListOptions {
                resource_version: if continue_token.is_some() {
                    String::new()
                } else {
                    resource_version.to_string()
                },
                page_size: self.config.page_size,
                continue_token: continue_token.clone(),
            };
            match self.list_watcher.list(opts, cancel).await {
                Ok(page) => {
                    pages += 1;
                    last_rv = page.metadata.resource_version;
                    items.extend(page.items);
                    continue_token = page.metadata.continue_token;
                    if continue_token.is_none() {
                        break;
                    }
                }
                Err(err) if pages > 0 && self.classifier.is_expired(&err) => {
                    tracing::info!("continuation token expired mid-page, falling back to a full list");
                    return self.single_unpaginated_list("", cancel).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(ListResponse {
            metadata: ListMetadata {
                resource_version: last_rv,
                paginated: pages > 1,
            },
            items,
        })
    }

    async fn single_unpaginated_list(
        &self,
        resource_version: &str,
        cancel: &CancellationToken,
    ) -> Result<ListResponse, Error> {
        let opts = ListOptions {
            resource_version: resource_version.to_string(),
            page_size: 0,
            continue_token: None,
        };
        let page = self.list_watcher.list(opts, cancel).await?;
        Ok(ListResponse {
            metadata: ListMetadata {
                resource_version: page.metadata.resource_version,
                paginated: false,
            },
            items: page.items,
        })
    }
}
