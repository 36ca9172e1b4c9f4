pub mod jobs;
pub mod rep_matcher;

use serde::Serialize;
use std::fmt;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub updated: u32,
    pub already_correct: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl SyncCounters {
    pub fn processed(&self) -> u32 {
        self.updated + self.already_correct + self.skipped + self.errors
    }

    fn record(&mut self, outcome: &ContactOutcome) {
        match outcome {
            ContactOutcome::Updated(_) => self.updated += 1,
            ContactOutcome::AlreadyCorrect => self.already_correct += 1,
            ContactOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

impl fmt::Display for SyncCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} updated, {} already correct, {} skipped, {} errors",
            self.updated, self.already_correct, self.skipped, self.errors
        )
    }
}

/// What happened to one contact during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactOutcome {
    Updated(String),
    AlreadyCorrect,
    Skipped(String),
}
