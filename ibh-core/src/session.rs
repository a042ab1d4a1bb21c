//! The facade the embedding shell talks to.
//!
//! A [`HarvesterSession`] owns the injected process-wide services — source
//! registry, MD5 ledger, rate limiter — and wires them into the search and
//! download pipeline. Nothing here is a singleton: tests build sessions
//! around in-memory fakes and throw them away.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ibh_common::log::warn;
use ibh_common::post::Post;
use ibh_sources::auth::Credentials;
use ibh_sources::client::RateLimiter;
use ibh_sources::descriptor::registry::SourceRegistry;
use ibh_sources::descriptor::{DescriptorError, SourceDescriptor};
use ibh_sources::{ApiClient, ClientError, FilterSet, Page};
use tokio::sync::Mutex;

use crate::error::DownloaderError;
use crate::filename::FilenameTemplate;
use crate::ledger::HashLedger;
use crate::monitor::{MonitorScheduler, SearchProvider};
use crate::queue::{Batch, BatchOptions};

/// One page of search results after filtering.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// The raw parsed page, pagination metadata included.
    pub page: Page,
    /// Posts cleared for download.
    pub allowed: Vec<Post>,
    /// Posts held back, with the reason each one was rejected.
    pub rejected: Vec<(Post, String)>,
    /// Posts matching both whitelist and blacklist: the caller decides.
    pub conflicts: Vec<(Post, String, String)>,
}

/// Owns the pipeline's injected services and exposes the external interface.
pub struct HarvesterSession {
    registry: Arc<SourceRegistry>,
    ledger: Arc<HashLedger>,
    limiter: Arc<RateLimiter>,
    filters: RwLock<FilterSet>,
    credentials: RwLock<HashMap<String, Credentials>>,
    clients: Mutex<HashMap<String, Arc<ApiClient>>>,
}

impl HarvesterSession {
    pub fn new(registry: Arc<SourceRegistry>, ledger: Arc<HashLedger>) -> Self {
        Self {
            registry,
            ledger,
            limiter: Arc::new(RateLimiter::new()),
            filters: RwLock::new(FilterSet::new()),
            credentials: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<HashLedger> {
        &self.ledger
    }

    /// Replaces the session-wide blacklist/whitelist configuration.
    pub fn set_filters(&self, filters: FilterSet) {
        *self.filters.write().unwrap() = filters;
    }

    /// Stores credentials for one source. The next client built for that
    /// source picks them up.
    pub async fn set_credentials(&self, source: &str, credentials: Credentials) {
        self.credentials
            .write()
            .unwrap()
            .insert(source.to_string(), credentials);
        // Drop any cached client so the new credentials take effect.
        self.clients.lock().await.remove(source);
    }

    pub fn register_source(&self, descriptor: SourceDescriptor) -> Result<(), DescriptorError> {
        self.registry.register(descriptor)
    }

    pub fn list_sources(&self) -> Vec<Arc<SourceDescriptor>> {
        self.registry.list()
    }

    pub async fn remove_source(&self, name: &str) -> Option<Arc<SourceDescriptor>> {
        self.clients.lock().await.remove(name);
        self.registry.remove(name)
    }

    /// The shared, cached API client for one source.
    pub async fn client_for(&self, source: &str) -> Result<Arc<ApiClient>, ClientError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(source) {
            return Ok(client.clone());
        }

        let descriptor = self
            .registry
            .get(source)
            .ok_or_else(|| ClientError::UnknownSource {
                name: source.to_string(),
            })?;
        let credentials = self
            .credentials
            .read()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_default();

        let client = Arc::new(ApiClient::new(descriptor, self.limiter.clone(), credentials));
        clients.insert(source.to_string(), client.clone());
        Ok(client)
    }

    /// Searches one source and filters the resulting page.
    ///
    /// A malformed page is logged and treated as empty rather than failing
    /// the caller; transport and API failures surface as [`ClientError`].
    pub async fn search(
        &self,
        source: &str,
        tags: &[String],
        page: u32,
        per_page: u32,
        post_filter: Option<&str>,
    ) -> Result<SearchOutcome, ClientError> {
        let client = self.client_for(source).await?;

        let parsed = match client.search_page(tags, page, per_page).await {
            Ok(parsed) => parsed,
            Err(ClientError::Parse { source: error }) => {
                warn!("Treating malformed page {page} from '{source}' as empty: {error}");
                Page::empty(page, per_page)
            }
            Err(error) => return Err(error),
        };

        let mut filters = self.filters.read().unwrap().clone();
        if let Some(line) = post_filter {
            filters = filters.with_post_filter(line);
        }

        let posts = parsed.posts.clone();
        let (allowed, rejected, conflicts) = filters.partition(posts);

        Ok(SearchOutcome {
            page: parsed,
            allowed,
            rejected,
            conflicts,
        })
    }

    /// Searches several sources and merges the filtered outcomes, ordered by
    /// source then post order. A source that fails is logged and skipped so
    /// one dead site never empties the whole result set.
    pub async fn search_many(
        &self,
        sources: &[String],
        tags: &[String],
        page: u32,
        per_page: u32,
        post_filter: Option<&str>,
    ) -> SearchOutcome {
        let mut merged = SearchOutcome {
            page: Page::empty(page, per_page),
            ..SearchOutcome::default()
        };

        for source in sources {
            match self.search(source, tags, page, per_page, post_filter).await {
                Ok(outcome) => {
                    merged.page.posts.extend(outcome.page.posts);
                    merged.allowed.extend(outcome.allowed);
                    merged.rejected.extend(outcome.rejected);
                    merged.conflicts.extend(outcome.conflicts);
                }
                Err(error) => warn!("Search on '{source}' failed: {error}"),
            }
        }
        merged
    }

    /// Builds a download batch for already-filtered posts.
    pub async fn create_batch(
        &self,
        source: &str,
        posts: Vec<Post>,
        template: &FilenameTemplate,
        search_tags: &[String],
        dest_dir: &Path,
        options: BatchOptions,
    ) -> Result<Batch, DownloaderError> {
        let client = self.client_for(source).await?;
        let batch = Batch::new(
            client,
            self.ledger.clone(),
            posts,
            template,
            search_tags,
            dest_dir,
            options,
        )?;
        Ok(batch)
    }

    /// A monitor scheduler backed by this session's search pipeline.
    pub fn monitor_scheduler(self: &Arc<Self>) -> MonitorScheduler {
        MonitorScheduler::new(self.clone())
    }
}

#[async_trait]
impl SearchProvider for HarvesterSession {
    async fn search(
        &self,
        source: &str,
        tags: &[String],
        page: u32,
        per_page: u32,
        post_filter: Option<&str>,
    ) -> Result<Page, ClientError> {
        let outcome =
            Self::search(self, source, tags, page, per_page, post_filter).await?;
        // Monitors only ever see posts that passed the filters.
        Ok(Page {
            posts: outcome.allowed,
            page: outcome.page.page,
            per_page: outcome.page.per_page,
            total: outcome.page.total,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let session = HarvesterSession::new(
            Arc::new(SourceRegistry::new()),
            Arc::new(HashLedger::in_memory()),
        );
        assert!(matches!(
            session.client_for("nope").await,
            Err(ClientError::UnknownSource { .. })
        ));
    }

    #[tokio::test]
    async fn clients_are_cached_per_source() {
        let session = HarvesterSession::new(
            Arc::new(SourceRegistry::with_defaults()),
            Arc::new(HashLedger::in_memory()),
        );
        let first = session.client_for("danbooru").await.unwrap();
        let second = session.client_for("danbooru").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn new_credentials_invalidate_the_cached_client() {
        let session = HarvesterSession::new(
            Arc::new(SourceRegistry::with_defaults()),
            Arc::new(HashLedger::in_memory()),
        );
        let first = session.client_for("danbooru").await.unwrap();
        session
            .set_credentials("danbooru", Credentials::default())
            .await;
        let second = session.client_for("danbooru").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
