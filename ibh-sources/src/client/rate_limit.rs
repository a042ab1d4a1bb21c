//! Per-(site, resource-type) request pacing.
//!
//! Every source declares a minimum delay between requests for each
//! [`ResourceType`](crate::descriptor::ResourceType). The limiter tracks the
//! last request instant per `(site, resource)` pair; concurrent requests to
//! the same pair serialize on that pair's mutex, while different sites or
//! different resource types on the same site proceed independently.
//!
//! The limiter is the one piece of state shared by every batch in the
//! process, so it is designed to be wrapped in an `Arc` and cloned freely.
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ibh_common::log::debug;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::descriptor::ResourceType;

#[derive(Debug)]
struct Slot {
    /// `None` until the first request for this key goes out.
    last_request: Mutex<Option<Instant>>,
}

/// Pacing guard keyed by `(site, resource-type)`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    slots: DashMap<(String, ResourceType), Arc<Slot>>,
    disabled: bool,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limiter that never waits. Used by tests that exercise other parts
    /// of the pipeline.
    pub fn disabled() -> Self {
        Self {
            slots: DashMap::new(),
            disabled: true,
        }
    }

    /// Waits until a request to `site` for `resource` is allowed, then
    /// stamps the slot. The first request for a key proceeds immediately.
    ///
    /// The slot's mutex is held across the sleep, which is what serializes
    /// two concurrent callers for the same key: the second only stamps (and
    /// returns) after the first's interval has elapsed.
    pub async fn acquire(&self, site: &str, resource: ResourceType, interval: Duration) {
        if self.disabled || interval.is_zero() {
            return;
        }

        // Clone the Arc so the DashMap shard lock is released before any await.
        let slot = self
            .slots
            .entry((site.to_string(), resource))
            .or_insert_with(|| {
                Arc::new(Slot {
                    last_request: Mutex::new(None),
                })
            })
            .clone();

        let mut last = slot.last_request.lock().await;
        if let Some(stamp) = *last {
            let elapsed = stamp.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                debug!(
                    "Pacing {site}/{resource:?}: waiting {} ms",
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}
