//! Authenticated, paced HTTP access to one source.
//!
//! An [`ApiClient`] owns the `reqwest::Client` for a site (user agent and
//! cookie store included), the site's [`AuthSession`], and a handle to the
//! process-wide [`RateLimiter`]. Every request goes through the same
//! sequence: transport-policy rewrite, pacing slot, auth decoration, send,
//! one transparent token-refresh retry on 401, then status classification.
//!
//! Failures come back as [`ClientError`] values; nothing in here panics past
//! the caller.
use std::sync::Arc;

use ibh_common::log::{debug, warn};
use ibh_common::{client, join_tags};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;

use crate::auth::{AuthError, AuthSession, Credentials};
use crate::descriptor::{ResourceType, SourceDescriptor, TransportPolicy};
use crate::parser::{self, Page, ParseError};

pub mod rate_limit;

pub use rate_limit::RateLimiter;

/// Classified request failures. The variants mirror the ways imageboard APIs
/// actually refuse work, so the pipeline can decide between retrying,
/// surfacing, or skipping without inspecting status codes itself.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection refused or a 5xx answer: the site is down or melting.
    #[error("Source server is offline or unreachable")]
    ServerOffline,

    /// The search used more tags than the site's API tier allows.
    #[error("Too many tags for this source's search API")]
    TooManyTags,

    /// Pagination ran past the site's maximum searchable depth.
    #[error("Requested page is beyond the source's pagination limit")]
    PageTooFar,

    /// Credentials rejected even after a token refresh.
    #[error("Invalid or expired credentials")]
    InvalidCredentials,

    /// The site asked us to slow down.
    #[error("Source is rate limiting this client")]
    RateLimited,

    /// The resource is gone, but the site itself is fine.
    #[error("Remote resource not found")]
    NotFound,

    /// A timeout or mid-transfer drop; worth retrying with backoff.
    #[error("Transient network failure: {message}")]
    TransientNetwork { message: String },

    /// The descriptor has no endpoint for the requested operation.
    #[error("This source exposes no API for the requested operation")]
    NoApiAvailable,

    /// The caller named a source the registry doesn't know.
    #[error("No source named '{name}' is registered")]
    UnknownSource { name: String },

    /// A plaintext request was redirected to HTTPS and the descriptor has no
    /// recorded transport decision; the caller should offer the persistent
    /// always / never-for-site / never choice and store it in the registry.
    #[error("Source offered an upgrade to secure transport at {location}")]
    SecureUpgradeOffered { location: String },

    #[error("Authentication failed: {source}")]
    Auth {
        #[from]
        source: AuthError,
    },

    #[error("Failed to parse source response: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },
}

/// Per-source API client. Cheap to share: wrap in `Arc` and hand it to every
/// batch that downloads from the same site.
#[derive(Debug)]
pub struct ApiClient {
    descriptor: Arc<SourceDescriptor>,
    http: Client,
    auth: AuthSession,
    limiter: Arc<RateLimiter>,
}

impl ApiClient {
    pub fn new(
        descriptor: Arc<SourceDescriptor>,
        limiter: Arc<RateLimiter>,
        credentials: Credentials,
    ) -> Self {
        let http = client!(&descriptor.user_agent);
        let auth = AuthSession::new(descriptor.auth, credentials);

        Self {
            descriptor,
            http,
            auth,
            limiter,
        }
    }

    pub fn descriptor(&self) -> &Arc<SourceDescriptor> {
        &self.descriptor
    }

    /// The inner client, for callers that reuse the connection pool.
    pub fn http(&self) -> Client {
        self.http.clone()
    }

    /// Fetches and parses one page of search results.
    ///
    /// `page` is 1-indexed. A page with zero posts and HTTP success parses
    /// into a valid empty [`Page`]; only transport and API failures are
    /// errors.
    pub async fn search_page(
        &self,
        tags: &[String],
        page: u32,
        per_page: u32,
    ) -> Result<Page, ClientError> {
        let endpoint = self
            .descriptor
            .endpoints
            .post_list
            .as_deref()
            .ok_or(ClientError::NoApiAvailable)?;

        let effective = self.descriptor.effective_tags(tags);
        let per_page = per_page.min(self.descriptor.max_post_limit);
        let url = Self::search_url(endpoint, &effective, page, per_page);

        let response = self.execute(url, ResourceType::Page).await?;
        let raw = response
            .bytes()
            .await
            .map_err(|e| Self::map_transport(&e))?;

        let parsed = parser::parse_page(&self.descriptor, &raw, page, per_page)?;
        debug!(
            "{}: page {page} parsed into {} posts",
            self.descriptor.name,
            parsed.posts.len()
        );
        Ok(parsed)
    }

    /// Fetches one post's details through the descriptor's `post` endpoint.
    pub async fn post_details(&self, id: u64) -> Result<ibh_common::post::Post, ClientError> {
        let endpoint = self
            .descriptor
            .endpoints
            .post
            .as_deref()
            .ok_or(ClientError::NoApiAvailable)?;
        let url = endpoint.replace("{id}", &id.to_string());

        let response = self.execute(url, ResourceType::Details).await?;
        let raw = response
            .bytes()
            .await
            .map_err(|e| Self::map_transport(&e))?;

        let page = parser::parse_page(&self.descriptor, &raw, 1, 1)?;
        page.posts
            .into_iter()
            .next()
            .ok_or(ClientError::NotFound)
    }

    /// Paced, authenticated fetch of a media URL, returned as a streaming
    /// response for the download pipeline to consume chunk by chunk.
    pub async fn fetch_media(
        &self,
        url: &str,
        resource: ResourceType,
    ) -> Result<Response, ClientError> {
        self.execute(url.to_string(), resource).await
    }

    /// The full request sequence shared by every operation.
    async fn execute(&self, url: String, resource: ResourceType) -> Result<Response, ClientError> {
        let url = self.apply_transport(url);
        let was_plaintext = url.starts_with("http://");

        self.limiter
            .acquire(
                &self.descriptor.name,
                resource,
                self.descriptor.intervals.interval(resource),
            )
            .await;

        let endpoints = &self.descriptor.endpoints;
        self.auth
            .ensure_ready(
                &self.http,
                endpoints.login.as_deref(),
                endpoints.token.as_deref(),
            )
            .await?;

        let mut response = self.send_once(&url).await?;

        // Expired OAuth2 token: refresh and retry the request exactly once.
        if response.status() == StatusCode::UNAUTHORIZED && self.auth.scheme().is_oauth2() {
            debug!("{}: got 401, refreshing token once", self.descriptor.name);
            self.auth
                .refresh(&self.http, endpoints.token.as_deref())
                .await?;
            response = self.send_once(&url).await?;
        }

        if was_plaintext
            && response.url().scheme() == "https"
            && self.descriptor.transport == TransportPolicy::Ask
        {
            return Err(ClientError::SecureUpgradeOffered {
                location: response.url().to_string(),
            });
        }

        Self::classify_status(response.status())?;
        Ok(response)
    }

    async fn send_once(&self, url: &str) -> Result<Response, ClientError> {
        let mut request = self.auth.apply(self.http.get(url));
        if let Some(token) = self.auth.bearer().await {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(|e| Self::map_transport(&e))
    }

    fn search_url(endpoint: &str, tags: &[String], page: u32, per_page: u32) -> String {
        let tag_string = join_tags!(tags);

        if endpoint.contains('{') {
            return endpoint
                .replace("{tags}", &tag_string)
                .replace("{page}", &page.to_string())
                .replace("{limit}", &per_page.to_string());
        }

        let sep = if endpoint.contains('?') { '&' } else { '?' };
        format!("{endpoint}{sep}limit={per_page}&page={page}&tags={tag_string}")
    }

    /// Rewrites plaintext URLs to HTTPS when the recorded policy says so.
    fn apply_transport(&self, url: String) -> String {
        if self.descriptor.transport == TransportPolicy::Always {
            if let Some(rest) = url.strip_prefix("http://") {
                return format!("https://{rest}");
            }
        }
        url
    }

    fn map_transport(error: &reqwest::Error) -> ClientError {
        if error.is_connect() {
            warn!("Connection failure: {error}");
            return ClientError::ServerOffline;
        }
        ClientError::TransientNetwork {
            message: error.to_string(),
        }
    }

    /// Maps an HTTP status to the failure taxonomy. The specific codes
    /// follow what the big booru engines actually return: 410 for paging too
    /// deep, 422 for over-limit tag counts.
    fn classify_status(status: StatusCode) -> Result<(), ClientError> {
        match status.as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(ClientError::InvalidCredentials),
            404 => Err(ClientError::NotFound),
            410 => Err(ClientError::PageTooFar),
            422 => Err(ClientError::TooManyTags),
            429 => Err(ClientError::RateLimited),
            500..=599 => Err(ClientError::ServerOffline),
            _ => Err(ClientError::TransientNetwork {
                message: format!("unexpected status {status}"),
            }),
        }
    }
}
