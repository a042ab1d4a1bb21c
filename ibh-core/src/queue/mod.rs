//! The concurrent download queue.
//!
//! # Batches
//!
//! A [`Batch`] binds a list of filtered posts to resolved destination paths
//! and drives their transfers through a bounded worker pool. Each job moves
//! through `Queued → Active → {Success | Failed | Skipped | AlreadyExists |
//! NotFound}`, with `Paused` and `Cancelled` as user- or space-driven
//! detours. Workers process one job end-to-end: ledger check, paced fetch,
//! chunked write, hash verification, ledger record, optional sidecar.
//!
//! Control is cooperative. Pausing stops promotion but lets in-flight
//! transfers finish; cancelling signals in-flight workers to abandon at the
//! next chunk and removes their partial files; running out of disk space
//! pauses the *whole* batch (`PausedSpace`) with every unfinished job
//! preserved for resume.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use ibh_common::log::{debug, warn};
use ibh_common::post::Post;
use ibh_sources::descriptor::ResourceType;
use ibh_sources::{ApiClient, ClientError};
use tokio::fs::{create_dir_all, remove_file, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::filename::{FilenameTemplate, TemplateContext};
use crate::ledger::{HashLedger, LedgerStatus};

pub mod error;
pub mod summary;

pub use error::QueueError;
pub use summary::BatchSummary;

/// What to do when a destination filename is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Keep both files, disambiguating the new one with a counter suffix.
    #[default]
    Copy,
    /// Overwrite the existing file.
    Move,
    /// Skip the new file.
    DontSave,
}

/// Batch-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Concurrently active jobs. `0` means use the source descriptor's
    /// `max_simultaneous_downloads`.
    pub simultaneous: u8,
    /// Transfer attempts per job before it resolves to `Failed`.
    pub retries: u32,
    /// Transfer even when the ledger already records the hash.
    pub force_redownload: bool,
    /// Template for a sibling metadata text file written next to each
    /// downloaded file, resolved by the same engine as filenames.
    pub sidecar_template: Option<String>,
    /// Also save the downscaled sample when the post has one.
    pub save_sample: bool,
    /// Policy when the destination file already exists on disk.
    pub collision_existing: CollisionPolicy,
    /// Policy when one post yields several files with the same name.
    pub collision_multi: CollisionPolicy,
}

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Paused,
    Cancelled,
    Done(JobOutcome),
}

/// Terminal result of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed,
    Skipped,
    AlreadyExists,
    NotFound,
}

/// One post bound to a destination path.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub post: Post,
    pub dest: PathBuf,
    pub state: JobState,
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Batch-level state, driven by the user and the space condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Running,
    Paused,
    /// The destination ran out of space. All transfers are halted with job
    /// states preserved; resuming continues exactly the unfinished jobs.
    PausedSpace,
    Cancelled,
    Finished,
}

/// One progress tick, streamed to every subscriber.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job: usize,
    pub post_id: u64,
    pub state: JobState,
    pub bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    errored: AtomicU64,
    skipped: AtomicU64,
    already_exists: AtomicU64,
    not_found: AtomicU64,
}

enum TransferResult {
    Success { bytes: u64 },
    NotFound,
    Failed(String),
    SpacePause,
    Cancelled,
}

enum StreamFailure {
    Space,
    Cancelled,
    Io(String),
    Chunk(String),
}

struct BatchInner {
    jobs: Vec<Mutex<DownloadJob>>,
    dest_dir: PathBuf,
    search_tags: Vec<String>,
    control: watch::Sender<BatchState>,
    notify: Notify,
    active: AtomicUsize,
    counters: Counters,
    ignored: AtomicU64,
    subscribers: Mutex<Vec<UnboundedSender<ProgressEvent>>>,
    api: Arc<ApiClient>,
    ledger: Arc<HashLedger>,
    opts: BatchOptions,
}

/// Handle to one user-initiated download batch. Clone-cheap; all state lives
/// behind the inner `Arc`.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    /// Resolves every post's destination through the template engine and
    /// builds the job list. Nothing is transferred until [`Batch::run`].
    pub fn new(
        api: Arc<ApiClient>,
        ledger: Arc<HashLedger>,
        posts: Vec<Post>,
        template: &FilenameTemplate,
        search_tags: &[String],
        dest_dir: &Path,
        opts: BatchOptions,
    ) -> Result<Self, QueueError> {
        let source = api.descriptor().name.clone();
        let mut jobs = Vec::with_capacity(posts.len());

        for (index, post) in posts.into_iter().enumerate() {
            let ctx = TemplateContext {
                post: &post,
                search_tags,
                source: &source,
                sequence: Some(index as u32 + 1),
            };
            let name = template.resolve(&ctx)?;
            jobs.push(Mutex::new(DownloadJob {
                dest: dest_dir.join(name),
                post,
                state: JobState::Queued,
                attempts: 0,
                bytes: 0,
                error: None,
            }));
        }

        let (control, _) = watch::channel(BatchState::Running);

        Ok(Self {
            inner: Arc::new(BatchInner {
                jobs,
                dest_dir: dest_dir.to_path_buf(),
                search_tags: search_tags.to_vec(),
                control,
                notify: Notify::new(),
                active: AtomicUsize::new(0),
                counters: Counters::default(),
                ignored: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                api,
                ledger,
                opts,
            }),
        })
    }

    /// Streams every progress event of this batch. Subscribing after `run`
    /// started only yields events from that point on.
    pub fn subscribe(&self) -> UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Runs the batch to completion: spawns the worker pool, waits for every
    /// job to reach a terminal state (or the batch to be cancelled) and
    /// returns the summary.
    pub async fn run(&self) -> Result<BatchSummary, QueueError> {
        create_dir_all(&self.inner.dest_dir)
            .await
            .map_err(|error| QueueError::DirCreationError {
                message: error.to_string(),
            })?;

        let cap = self.concurrency_cap();
        debug!("Batch started: {} jobs, cap {cap}", self.inner.jobs.len());

        let workers: Vec<JoinHandle<()>> = (0..cap)
            .map(|_| {
                let inner = self.inner.clone();
                tokio::spawn(async move { worker(inner).await })
            })
            .collect();

        for handle in workers {
            handle.await?;
        }

        // Sweep jobs a cancel left behind.
        let final_state = *self.inner.control.borrow();
        if final_state == BatchState::Cancelled {
            for index in 0..self.inner.jobs.len() {
                let mut job = self.inner.jobs[index].lock().unwrap();
                if !matches!(job.state, JobState::Done(_) | JobState::Cancelled) {
                    job.state = JobState::Cancelled;
                    let (post_id, bytes) = (job.post.id, job.bytes);
                    drop(job);
                    self.inner.emit(index, JobState::Cancelled, bytes, None, post_id);
                }
            }
        } else {
            self.inner.control.send_replace(BatchState::Finished);
        }

        Ok(self.summary())
    }

    fn concurrency_cap(&self) -> usize {
        let configured = if self.inner.opts.simultaneous == 0 {
            self.inner.api.descriptor().max_simultaneous_downloads
        } else {
            self.inner.opts.simultaneous
        };
        configured.max(1) as usize
    }

    /// Stops promoting queued jobs; in-flight transfers finish first.
    pub fn pause(&self) {
        self.inner.control.send_if_modified(|state| {
            if *state == BatchState::Running {
                *state = BatchState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resumes a paused (or space-paused) batch. Jobs parked by the space
    /// condition go back to the queue.
    pub fn resume(&self) {
        for job in &self.inner.jobs {
            let mut job = job.lock().unwrap();
            if job.state == JobState::Paused {
                job.state = JobState::Queued;
            }
        }
        self.inner.control.send_if_modified(|state| {
            if matches!(state, BatchState::Paused | BatchState::PausedSpace) {
                *state = BatchState::Running;
                true
            } else {
                false
            }
        });
        self.inner.notify.notify_waiters();
    }

    /// Cooperative cancel: queued jobs stop being promoted and in-flight
    /// workers abandon after their current chunk, removing partial files.
    pub fn cancel(&self) {
        self.inner.control.send_replace(BatchState::Cancelled);
        self.inner.notify.notify_waiters();
    }

    /// Skips one queued job.
    pub fn skip_job(&self, index: usize) {
        let Some(slot) = self.inner.jobs.get(index) else {
            return;
        };
        let mut job = slot.lock().unwrap();
        if job.state == JobState::Queued {
            job.state = JobState::Done(JobOutcome::Skipped);
            let post_id = job.post.id;
            drop(job);
            self.inner.counters.skipped.fetch_add(1, Ordering::SeqCst);
            self.inner
                .emit(index, JobState::Done(JobOutcome::Skipped), 0, None, post_id);
            self.inner.notify.notify_waiters();
        }
    }

    /// Parks one queued job without skipping it.
    pub fn pause_job(&self, index: usize) {
        if let Some(slot) = self.inner.jobs.get(index) {
            let mut job = slot.lock().unwrap();
            if job.state == JobState::Queued {
                job.state = JobState::Paused;
            }
        }
    }

    /// Returns a parked job to the queue.
    pub fn resume_job(&self, index: usize) {
        if let Some(slot) = self.inner.jobs.get(index) {
            let mut job = slot.lock().unwrap();
            if job.state == JobState::Paused {
                job.state = JobState::Queued;
                drop(job);
                self.inner.notify.notify_waiters();
            }
        }
    }

    /// Re-queues every failed job for a subsequent [`Batch::run`] call.
    pub fn requeue_failed(&self) -> usize {
        let mut requeued = 0;
        for job in &self.inner.jobs {
            let mut job = job.lock().unwrap();
            if job.state == JobState::Done(JobOutcome::Failed) {
                job.state = JobState::Queued;
                job.attempts = 0;
                job.error = None;
                requeued += 1;
            }
        }
        requeued
    }

    pub fn state(&self) -> BatchState {
        *self.inner.control.borrow()
    }

    /// Snapshot of every job, for link-list export and listings.
    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.inner
            .jobs
            .iter()
            .map(|j| j.lock().unwrap().clone())
            .collect()
    }

    pub fn job_state(&self, index: usize) -> Option<JobState> {
        self.inner
            .jobs
            .get(index)
            .map(|j| j.lock().unwrap().state)
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }

    /// Number of jobs currently mid-transfer.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Posts the filter engine held back before this batch was created;
    /// folded into the summary for end-of-run accounting.
    pub fn set_ignored(&self, count: u64) {
        self.inner.ignored.store(count, Ordering::SeqCst);
    }

    /// Summary computed from the terminal job states.
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            ignored: self.inner.ignored.load(Ordering::SeqCst),
            ..BatchSummary::default()
        };
        for job in &self.inner.jobs {
            match job.lock().unwrap().state {
                JobState::Done(JobOutcome::Success) => summary.succeeded += 1,
                JobState::Done(JobOutcome::Failed) => summary.errored += 1,
                JobState::Done(JobOutcome::Skipped) => summary.skipped += 1,
                JobState::Done(JobOutcome::AlreadyExists) => summary.already_exists += 1,
                JobState::Done(JobOutcome::NotFound) => summary.not_found += 1,
                _ => {}
            }
        }
        summary
    }
}

/// One worker of the pool: claim, process, repeat. Exits when the batch is
/// cancelled or no job can ever become claimable again.
async fn worker(inner: Arc<BatchInner>) {
    let mut ctrl = inner.control.subscribe();
    loop {
        let state = *ctrl.borrow();
        match state {
            BatchState::Cancelled => break,
            BatchState::Paused | BatchState::PausedSpace => {
                if ctrl.changed().await.is_err() {
                    break;
                }
                continue;
            }
            BatchState::Running | BatchState::Finished => {}
        }

        match inner.claim_next() {
            Some(index) => {
                inner.active.fetch_add(1, Ordering::SeqCst);
                inner.process(index).await;
                inner.active.fetch_sub(1, Ordering::SeqCst);
                inner.notify.notify_waiters();
            }
            None => {
                if inner.active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                // A running job may still fail back into the queue; wait for
                // any state change before concluding there is nothing to do.
                tokio::select! {
                    () = inner.notify.notified() => {}
                    _ = ctrl.changed() => {}
                }
            }
        }
    }
}

impl BatchInner {
    fn emit(
        &self,
        job: usize,
        state: JobState,
        bytes: u64,
        error: Option<String>,
        post_id: u64,
    ) {
        let event = ProgressEvent {
            job,
            post_id,
            state,
            bytes,
            error,
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Promotes the first queued job to `Active`. Holding the job mutex for
    /// the whole check-and-set keeps two workers from claiming the same job.
    fn claim_next(&self) -> Option<usize> {
        for (index, slot) in self.jobs.iter().enumerate() {
            let mut job = slot.lock().unwrap();
            if job.state == JobState::Queued {
                job.state = JobState::Active;
                return Some(index);
            }
        }
        None
    }

    async fn process(&self, index: usize) {
        let (post, dest) = {
            let mut job = self.jobs[index].lock().unwrap();
            job.error = None;
            (job.post.clone(), job.dest.clone())
        };
        self.emit(index, JobState::Active, 0, None, post.id);

        // Dedup against the ledger before any transfer.
        let mut claimed = false;
        if !self.opts.force_redownload {
            if let Some(md5) = &post.md5 {
                match self.ledger.check_and_claim(md5).await {
                    LedgerStatus::AlreadyRecorded { .. } | LedgerStatus::InFlight => {
                        debug!("{md5} already in ledger, skipping transfer");
                        self.finish(index, JobOutcome::AlreadyExists, None, &post);
                        return;
                    }
                    LedgerStatus::Claimed => claimed = true,
                }
            }
        }

        // Filename collision with a file already on disk.
        let dest = match self.resolve_existing_collision(dest) {
            Some(dest) => dest,
            None => {
                if claimed {
                    if let Some(md5) = &post.md5 {
                        self.ledger.release(md5).await;
                    }
                }
                self.finish(index, JobOutcome::Skipped, None, &post);
                return;
            }
        };

        match self.transfer_with_retries(index, &post, &dest).await {
            TransferResult::Success { bytes } => {
                if let Some(md5) = &post.md5 {
                    if let Err(error) = self.ledger.record(md5, &dest).await {
                        warn!("Failed to record {md5} in ledger: {error}");
                    }
                }
                self.write_sidecar(&post, &dest).await;
                self.save_sample(&post, &dest).await;
                {
                    let mut job = self.jobs[index].lock().unwrap();
                    job.bytes = bytes;
                }
                self.finish(index, JobOutcome::Success, None, &post);
            }
            TransferResult::NotFound => {
                if claimed {
                    if let Some(md5) = &post.md5 {
                        self.ledger.release(md5).await;
                    }
                }
                self.finish(index, JobOutcome::NotFound, None, &post);
            }
            TransferResult::Failed(reason) => {
                if claimed {
                    if let Some(md5) = &post.md5 {
                        self.ledger.release(md5).await;
                    }
                }
                self.finish(index, JobOutcome::Failed, Some(reason), &post);
            }
            TransferResult::SpacePause => {
                if claimed {
                    if let Some(md5) = &post.md5 {
                        self.ledger.release(md5).await;
                    }
                }
                {
                    let mut job = self.jobs[index].lock().unwrap();
                    job.state = JobState::Paused;
                    job.bytes = 0;
                }
                self.emit(index, JobState::Paused, 0, None, post.id);
                self.enter_space_pause();
            }
            TransferResult::Cancelled => {
                if claimed {
                    if let Some(md5) = &post.md5 {
                        self.ledger.release(md5).await;
                    }
                }
                {
                    let mut job = self.jobs[index].lock().unwrap();
                    job.state = JobState::Cancelled;
                }
                self.emit(index, JobState::Cancelled, 0, None, post.id);
            }
        }
    }

    /// Applies the already-exists-on-disk collision policy.
    fn resolve_existing_collision(&self, dest: PathBuf) -> Option<PathBuf> {
        if !dest.exists() {
            return Some(dest);
        }
        match self.opts.collision_existing {
            CollisionPolicy::Move => Some(dest),
            CollisionPolicy::DontSave => None,
            CollisionPolicy::Copy => Some(disambiguate(&dest)),
        }
    }

    async fn transfer_with_retries(
        &self,
        index: usize,
        post: &Post,
        dest: &Path,
    ) -> TransferResult {
        let max_attempts = self.opts.retries.max(1);
        let backoff = self
            .api
            .descriptor()
            .intervals
            .interval(ResourceType::Error);

        for attempt in 1..=max_attempts {
            {
                let mut job = self.jobs[index].lock().unwrap();
                job.attempts += 1;
            }

            let failure = match self
                .api
                .fetch_media(&post.file_url, ResourceType::Image)
                .await
            {
                Ok(response) => match self.stream_to_file(index, post, dest, response).await {
                    Ok(bytes) => return TransferResult::Success { bytes },
                    Err(StreamFailure::Space) => return TransferResult::SpacePause,
                    Err(StreamFailure::Cancelled) => return TransferResult::Cancelled,
                    Err(StreamFailure::Io(message)) => {
                        // Filesystem trouble that isn't space: fail only
                        // this job, the batch keeps going.
                        return TransferResult::Failed(message);
                    }
                    Err(StreamFailure::Chunk(message)) => message,
                },
                Err(ClientError::NotFound) => return TransferResult::NotFound,
                Err(
                    error @ (ClientError::ServerOffline
                    | ClientError::RateLimited
                    | ClientError::TransientNetwork { .. }),
                ) => error.to_string(),
                Err(error) => return TransferResult::Failed(error.to_string()),
            };

            if attempt == max_attempts {
                return TransferResult::Failed(failure);
            }
            debug!(
                "Attempt {attempt}/{max_attempts} for post {} failed ({failure}), backing off",
                post.id
            );
            tokio::time::sleep(backoff).await;
        }
        TransferResult::Failed("retry budget exhausted".to_string())
    }

    /// Streams the response into the destination file chunk by chunk,
    /// hashing as it goes. Cancellation and the space condition are checked
    /// between chunks; both remove the partial file.
    async fn stream_to_file(
        &self,
        index: usize,
        post: &Post,
        dest: &Path,
        response: reqwest::Response,
    ) -> Result<u64, StreamFailure> {
        let ctrl = self.control.subscribe();

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)
            .await
            .map_err(|e| self.map_write_error(&e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut digest = md5::Context::new();
        let mut bytes: u64 = 0;

        while let Some(item) = stream.next().await {
            let control_state = *ctrl.borrow();
            match control_state {
                BatchState::Cancelled => {
                    drop(writer);
                    let _ = remove_file(dest).await;
                    return Err(StreamFailure::Cancelled);
                }
                BatchState::PausedSpace => {
                    // Another worker hit the space condition; stop writing
                    // and park this job too.
                    drop(writer);
                    let _ = remove_file(dest).await;
                    return Err(StreamFailure::Space);
                }
                _ => {}
            }

            let chunk = match item {
                Ok(chunk) => chunk,
                Err(error) => {
                    drop(writer);
                    let _ = remove_file(dest).await;
                    return Err(StreamFailure::Chunk(error.to_string()));
                }
            };

            digest.consume(&chunk);
            if let Err(error) = writer.write_all(&chunk).await {
                let failure = self.map_write_error(&error);
                drop(writer);
                let _ = remove_file(dest).await;
                return Err(failure);
            }
            bytes += chunk.len() as u64;
            self.emit(index, JobState::Active, bytes, None, post.id);
        }

        if let Err(error) = writer.flush().await {
            let failure = self.map_write_error(&error);
            let _ = remove_file(dest).await;
            return Err(failure);
        }

        // Verify against the API-provided hash; a mismatch means the file is
        // corrupted and worth one more attempt.
        if let Some(expected) = &post.md5 {
            let got = format!("{:x}", digest.compute());
            if &got != expected {
                warn!(
                    "MD5 mismatch for post {}: expected {expected}, got {got}",
                    post.id
                );
                let _ = remove_file(dest).await;
                return Err(StreamFailure::Chunk(format!(
                    "hash mismatch: expected {expected}, got {got}"
                )));
            }
        }

        Ok(bytes)
    }

    fn map_write_error(&self, error: &std::io::Error) -> StreamFailure {
        if is_space_error(error) {
            StreamFailure::Space
        } else {
            StreamFailure::Io(error.to_string())
        }
    }

    /// Halts the whole batch on the space condition. This is a pause, not a
    /// cancellation: every unfinished job keeps its state for resume.
    fn enter_space_pause(&self) {
        let changed = self.control.send_if_modified(|state| {
            if *state == BatchState::Running {
                *state = BatchState::PausedSpace;
                true
            } else {
                false
            }
        });
        if changed {
            warn!("Destination out of space, pausing batch");
        }
    }

    async fn write_sidecar(&self, post: &Post, dest: &Path) {
        let Some(template_text) = &self.opts.sidecar_template else {
            return;
        };
        let template = FilenameTemplate::new(template_text);
        let ctx = TemplateContext {
            post,
            search_tags: &self.search_tags,
            source: &self.api.descriptor().name,
            sequence: None,
        };
        match template.resolve(&ctx) {
            Ok(content) => {
                let mut path = dest.as_os_str().to_owned();
                path.push(".txt");
                if let Err(error) = tokio::fs::write(PathBuf::from(path), content).await {
                    warn!("Failed to write sidecar for post {}: {error}", post.id);
                }
            }
            Err(error) => warn!("Sidecar template failed for post {}: {error}", post.id),
        }
    }

    /// Saves the post's sample image next to the original. The sample always
    /// collides with the main file's name, so the multi-file collision
    /// policy decides what happens.
    async fn save_sample(&self, post: &Post, dest: &Path) {
        if !self.opts.save_sample {
            return;
        }
        let Some(sample_url) = &post.sample_url else {
            return;
        };

        let sample_dest = match self.opts.collision_multi {
            CollisionPolicy::DontSave => return,
            CollisionPolicy::Move => dest.to_path_buf(),
            CollisionPolicy::Copy => suffixed(dest, " (sample)"),
        };

        match self
            .api
            .fetch_media(sample_url, ResourceType::Thumbnail)
            .await
        {
            Ok(response) => match response.bytes().await {
                Ok(data) => {
                    if let Err(error) = tokio::fs::write(&sample_dest, &data).await {
                        warn!("Failed to save sample for post {}: {error}", post.id);
                    }
                }
                Err(error) => warn!("Failed to read sample for post {}: {error}", post.id),
            },
            Err(error) => warn!("Failed to fetch sample for post {}: {error}", post.id),
        }
    }

    fn finish(&self, index: usize, outcome: JobOutcome, error: Option<String>, post: &Post) {
        let bytes = {
            let mut job = self.jobs[index].lock().unwrap();
            job.state = JobState::Done(outcome);
            job.error.clone_from(&error);
            job.bytes
        };

        // Aggregate counters only ever increase; the UI can rely on that.
        let counter = match outcome {
            JobOutcome::Success => &self.counters.succeeded,
            JobOutcome::Failed => &self.counters.errored,
            JobOutcome::Skipped => &self.counters.skipped,
            JobOutcome::AlreadyExists => &self.counters.already_exists,
            JobOutcome::NotFound => &self.counters.not_found,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        self.emit(index, JobState::Done(outcome), bytes, error, post.id);
    }
}

/// The destination device is full, as opposed to any other write failure.
/// Space exhaustion pauses the whole batch; everything else fails one job.
fn is_space_error(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::StorageFull || error.raw_os_error() == Some(28)
}

/// `name.ext` → `name (1).ext`, `name (2).ext`, … first free slot wins.
fn disambiguate(dest: &Path) -> PathBuf {
    for counter in 1..u32::MAX {
        let candidate = suffixed(dest, &format!(" ({counter})"));
        if !candidate.exists() {
            return candidate;
        }
    }
    dest.to_path_buf()
}

/// Inserts a suffix between the file stem and its extension.
fn suffixed(dest: &Path, suffix: &str) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = dest
        .extension()
        .map_or_else(|| format!("{stem}{suffix}"), |ext| {
            format!("{stem}{suffix}.{}", ext.to_string_lossy())
        });
    dest.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filename::FilenameTemplate;
    use ibh_sources::auth::Credentials;
    use ibh_sources::client::RateLimiter;
    use ibh_sources::descriptor::DEFAULT_SOURCES;

    fn offline_batch(count: u64) -> Batch {
        let api = Arc::new(ApiClient::new(
            Arc::new(DEFAULT_SOURCES.get("danbooru").unwrap().clone()),
            Arc::new(RateLimiter::disabled()),
            Credentials::default(),
        ));
        let posts = (1..=count)
            .map(|id| Post {
                id,
                md5: Some(format!("{id:032x}")),
                file_url: format!("https://cdn.example/{id}.png"),
                ..Post::default()
            })
            .collect();
        Batch::new(
            api,
            Arc::new(HashLedger::in_memory()),
            posts,
            &FilenameTemplate::new("%id%.%ext%"),
            &[],
            Path::new("/tmp/unused"),
            BatchOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn space_pause_preserves_jobs_and_resume_requeues_them() {
        let batch = offline_batch(3);

        // A worker hits the space condition: its job parks and the whole
        // batch moves to PausedSpace.
        {
            let mut job = batch.inner.jobs[1].lock().unwrap();
            job.state = JobState::Paused;
        }
        batch.inner.enter_space_pause();
        assert_eq!(batch.state(), BatchState::PausedSpace);
        assert_eq!(batch.job_state(1), Some(JobState::Paused));
        assert_eq!(batch.job_state(0), Some(JobState::Queued));

        // Resume returns exactly the unfinished jobs to the queue.
        batch.resume();
        assert_eq!(batch.state(), BatchState::Running);
        assert_eq!(batch.job_state(1), Some(JobState::Queued));
    }

    #[test]
    fn skip_and_pause_only_touch_queued_jobs() {
        let batch = offline_batch(2);

        batch.skip_job(0);
        assert_eq!(batch.job_state(0), Some(JobState::Done(JobOutcome::Skipped)));
        // Skipping a terminal job is a no-op.
        batch.skip_job(0);
        assert_eq!(batch.summary().skipped, 1);

        batch.pause_job(1);
        assert_eq!(batch.job_state(1), Some(JobState::Paused));
        batch.resume_job(1);
        assert_eq!(batch.job_state(1), Some(JobState::Queued));
    }

    #[test]
    fn pause_only_applies_while_running() {
        let batch = offline_batch(1);
        batch.cancel();
        batch.pause();
        assert_eq!(batch.state(), BatchState::Cancelled);
    }

    #[test]
    fn space_error_detection() {
        let enospc = std::io::Error::from_raw_os_error(28);
        assert!(is_space_error(&enospc));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!is_space_error(&denied));
    }

    #[test]
    fn suffix_insertion() {
        assert_eq!(
            suffixed(Path::new("out/abc.png"), " (1)"),
            PathBuf::from("out/abc (1).png")
        );
        assert_eq!(
            suffixed(Path::new("out/noext"), " (sample)"),
            PathBuf::from("out/noext (sample)")
        );
    }

    #[test]
    fn summary_counts_match_job_states() {
        let summary = BatchSummary {
            succeeded: 3,
            already_exists: 1,
            skipped: 1,
            ..BatchSummary::default()
        };
        assert_eq!(summary.total(), 5);
    }
}
