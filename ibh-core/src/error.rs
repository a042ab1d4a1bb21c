use thiserror::Error;

use crate::filename::TemplateError;
use crate::ledger::LedgerError;
use crate::queue::error::QueueError;
use ibh_sources::ClientError;

/// Top-level error for callers that drive the whole pipeline through the
/// session facade. Each stage keeps its own error type; this one only
/// aggregates them at the boundary.
#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("Queue failure: {source}")]
    Queue {
        #[from]
        source: QueueError,
    },

    #[error("Request failure: {source}")]
    Client {
        #[from]
        source: ClientError,
    },

    #[error("Filename template failure: {source}")]
    Template {
        #[from]
        source: TemplateError,
    },

    #[error("Ledger failure: {source}")]
    Ledger {
        #[from]
        source: LedgerError,
    },
}
