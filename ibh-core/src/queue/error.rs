use thiserror::Error;
use tokio::task::JoinError;

use crate::filename::TemplateError;
use crate::ledger::LedgerError;

/// Batch-fatal failures. Per-job failures never surface here; they are
/// recorded on the job and aggregated into the end-of-batch summary.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to create destination directory: {message}")]
    DirCreationError { message: String },

    #[error("Failed to access file: {source}")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },

    #[error("Failed to resolve destination filename: {source}")]
    TemplateFail {
        #[from]
        source: TemplateError,
    },

    #[error("Ledger failure: {source}")]
    LedgerFail {
        #[from]
        source: LedgerError,
    },

    #[error("Worker task failed to join: {source}")]
    WorkerJoinFail {
        #[from]
        source: JoinError,
    },
}
