//! End-of-batch accounting.
use std::fmt::Display;

use ibh_common::serde::{Deserialize, Serialize};

/// Terminal counts of one batch run. Per-job failures are folded in here
/// instead of being surfaced individually during the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: u64,
    /// Posts the filter engine rejected before the batch was created.
    pub ignored: u64,
    pub already_exists: u64,
    pub not_found: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl BatchSummary {
    /// Jobs that reached any terminal state.
    pub const fn total(&self) -> u64 {
        self.succeeded + self.already_exists + self.not_found + self.skipped + self.errored
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} ignored, {} already existing, {} not found, {} skipped, {} errored",
            self.succeeded,
            self.ignored,
            self.already_exists,
            self.not_found,
            self.skipped,
            self.errored
        )
    }
}
