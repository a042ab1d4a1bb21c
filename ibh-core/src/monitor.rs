//! Periodic re-runs of saved searches.
//!
//! # Monitors
//!
//! A monitor binds a saved search to an interval and remembers every post id
//! it has seen. On each tick of one cooperative timer loop, due monitors are
//! re-run through the regular search pipeline, new ids are diffed against
//! the seen set, and a [`MonitorEvent`] is emitted for the notification
//! layer — collapsed to a count-only form when the delta exceeds the
//! configured threshold. Monitors run one after another so a single site is
//! never hammered by its own monitors.
//!
//! Monitor state (intervals, last-check stamps, seen ids) persists as a
//! zstd-compressed bincode file, rewritten through a temp file so a crash
//! mid-save never corrupts the previous state.
use std::path::PathBuf;
use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ibh_common::log::{debug, warn};
use ibh_common::post::Post;
use ibh_common::serde::{Deserialize, Serialize};
use ibh_sources::{ClientError, Page};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};

/// Events above this many new posts collapse to a count-only notification.
const DEFAULT_COLLAPSE_THRESHOLD: usize = 5;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to access monitor state file: {source}")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },

    #[error("Failed to decode monitor state: {message}")]
    DecodeError { message: String },
}

/// The search a monitor re-runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub tags: Vec<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub post_filter: Option<String>,
    pub per_page: u32,
}

/// One persisted monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: u64,
    pub search: SavedSearch,
    /// Seconds between checks.
    pub interval_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
    /// Every post id this monitor has already reported.
    pub seen: AHashSet<u64>,
    /// Hand new posts straight to the download pipeline.
    pub auto_download: bool,
}

impl Monitor {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_check.is_none_or(|last| {
            (now - last).num_seconds() >= self.interval_secs as i64
        })
    }
}

/// Notification payload for the excluded tray/notification layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    pub monitor_id: u64,
    pub new_count: u64,
    /// Ids of the new posts; truncated when `collapsed` is set.
    pub sample_ids: Vec<u64>,
    /// More than the threshold arrived; the UI shows "N new images".
    pub collapsed: bool,
}

/// The search half of the pipeline, abstracted so tests can substitute a
/// fake and the scheduler never needs the full session.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        source: &str,
        tags: &[String],
        page: u32,
        per_page: u32,
        post_filter: Option<&str>,
    ) -> Result<Page, ClientError>;
}

/// Serialized monitor state.
#[derive(Debug, Serialize, Deserialize)]
struct MonitorStateFile {
    monitors: Vec<Monitor>,
    next_id: u64,
}

/// Drives all monitors off one timer loop.
pub struct MonitorScheduler {
    provider: Arc<dyn SearchProvider>,
    monitors: Mutex<Vec<Monitor>>,
    next_id: Mutex<u64>,
    events: UnboundedSender<MonitorEvent>,
    event_rx: Mutex<Option<UnboundedReceiver<MonitorEvent>>>,
    collapse_threshold: usize,
    state_path: Option<PathBuf>,
}

impl MonitorScheduler {
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        let (events, event_rx) = unbounded_channel();
        Self {
            provider,
            monitors: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            collapse_threshold: DEFAULT_COLLAPSE_THRESHOLD,
            state_path: None,
        }
    }

    /// Persists monitor state at `path`, restoring whatever a previous run
    /// saved there.
    pub async fn with_state_file(
        provider: Arc<dyn SearchProvider>,
        path: PathBuf,
    ) -> Result<Self, MonitorError> {
        let mut scheduler = Self::new(provider);
        scheduler.state_path = Some(path.clone());

        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let decoded = zstd::decode_all(&*raw)
                    .map_err(|e| MonitorError::DecodeError {
                        message: e.to_string(),
                    })
                    .and_then(|bytes| {
                        bincode::deserialize::<MonitorStateFile>(&bytes).map_err(|e| {
                            MonitorError::DecodeError {
                                message: e.to_string(),
                            }
                        })
                    })?;
                *scheduler.monitors.get_mut() = decoded.monitors;
                *scheduler.next_id.get_mut() = decoded.next_id;
                debug!(
                    "Restored {} monitors from state file",
                    scheduler.monitors.get_mut().len()
                );
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("No monitor state file yet");
            }
            Err(error) => return Err(error.into()),
        }

        Ok(scheduler)
    }

    /// Takes the notification event stream. Can only be taken once.
    pub async fn take_events(&self) -> Option<UnboundedReceiver<MonitorEvent>> {
        self.event_rx.lock().await.take()
    }

    pub async fn add_monitor(
        &self,
        search: SavedSearch,
        interval_secs: u64,
        auto_download: bool,
    ) -> u64 {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.monitors.lock().await.push(Monitor {
            id,
            search,
            interval_secs,
            last_check: None,
            seen: AHashSet::new(),
            auto_download,
        });
        self.persist().await;
        id
    }

    pub async fn remove_monitor(&self, id: u64) -> bool {
        let mut monitors = self.monitors.lock().await;
        let before = monitors.len();
        monitors.retain(|m| m.id != id);
        let removed = monitors.len() != before;
        drop(monitors);
        if removed {
            self.persist().await;
        }
        removed
    }

    pub async fn list(&self) -> Vec<Monitor> {
        self.monitors.lock().await.clone()
    }

    /// Runs every due monitor once, sequentially, and returns the new posts
    /// of monitors that want them auto-downloaded.
    pub async fn run_due(&self) -> Vec<(u64, Vec<Post>)> {
        let now = Utc::now();
        let due: Vec<Monitor> = self
            .monitors
            .lock()
            .await
            .iter()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();

        let mut auto_downloads = Vec::new();

        for monitor in due {
            let mut fresh: Vec<Post> = Vec::new();

            for source in &monitor.search.sources {
                match self
                    .provider
                    .search(
                        source,
                        &monitor.search.tags,
                        1,
                        monitor.search.per_page,
                        monitor.search.post_filter.as_deref(),
                    )
                    .await
                {
                    Ok(page) => {
                        fresh.extend(
                            page.posts
                                .into_iter()
                                .filter(|p| !monitor.seen.contains(&p.id)),
                        );
                    }
                    Err(error) => {
                        warn!(
                            "Monitor {} search on '{source}' failed: {error}",
                            monitor.id
                        );
                    }
                }
            }

            let new_ids: Vec<u64> = fresh.iter().map(|p| p.id).collect();

            {
                let mut monitors = self.monitors.lock().await;
                if let Some(stored) = monitors.iter_mut().find(|m| m.id == monitor.id) {
                    stored.last_check = Some(now);
                    stored.seen.extend(new_ids.iter().copied());
                }
            }

            if !new_ids.is_empty() {
                let collapsed = new_ids.len() > self.collapse_threshold;
                let sample_ids = if collapsed {
                    new_ids[..self.collapse_threshold].to_vec()
                } else {
                    new_ids.clone()
                };
                let event = MonitorEvent {
                    monitor_id: monitor.id,
                    new_count: new_ids.len() as u64,
                    sample_ids,
                    collapsed,
                };
                debug!(
                    "Monitor {} found {} new posts",
                    monitor.id, event.new_count
                );
                let _ = self.events.send(event);

                if monitor.auto_download {
                    auto_downloads.push((monitor.id, fresh));
                }
            }
        }

        self.persist().await;
        auto_downloads
    }

    /// The cooperative timer loop. Ticks every `tick_secs`, runs due
    /// monitors, and exits when `shutdown` flips to `true`.
    pub async fn run_loop(&self, tick_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Crash-safe state rewrite: temp file, then rename.
    async fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };

        let state = MonitorStateFile {
            monitors: self.monitors.lock().await.clone(),
            next_id: *self.next_id.lock().await,
        };

        let encoded = match bincode::serialize(&state) {
            Ok(bytes) => match zstd::encode_all(&*bytes, 3) {
                Ok(compressed) => compressed,
                Err(error) => {
                    warn!("Failed to compress monitor state: {error}");
                    return;
                }
            },
            Err(error) => {
                warn!("Failed to encode monitor state: {error}");
                return;
            }
        };

        let tmp = path.with_extension("tmp");
        if let Err(error) = tokio::fs::write(&tmp, &encoded).await {
            warn!("Failed to write monitor state: {error}");
            return;
        }
        if let Err(error) = tokio::fs::rename(&tmp, path).await {
            warn!("Failed to move monitor state into place: {error}");
        }
    }
}
