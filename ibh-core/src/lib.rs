//! Main download infrastructure for imageboard-harvester.
//!
//! This crate drives everything that happens after a page of posts has been
//! fetched and filtered: resolving destination filenames through the
//! [template engine](filename), deduplicating against the persistent
//! [MD5 ledger](ledger), running the concurrent, pausable, retryable
//! [download queue](queue), saving and restoring pending-download
//! [link lists](linklist), and re-running saved searches on a timer through
//! the [monitor scheduler](monitor). The [`HarvesterSession`](session)
//! facade wires the pieces together for the embedding shell.

pub mod error;
pub mod filename;
pub mod ledger;
pub mod linklist;
pub mod monitor;
pub mod queue;
pub mod session;

pub use error::DownloaderError;
pub use filename::{FilenameTemplate, TemplateContext};
pub use ledger::HashLedger;
pub use queue::{Batch, BatchOptions, BatchState, BatchSummary};
pub use session::HarvesterSession;
