//! Commit-phase timing profile

use meridian_common::TxnId;
use std::time::{Duration, Instant};

/// Per-phase durations of one commit, logged when the transaction closes
#[derive(Debug, Default)]
pub struct CommitProfile {
    mark: Option<Instant>,
    prewrite_primary: Option<Duration>,
    prewrite_secondary: Option<Duration>,
    commit_primary: Option<Duration>,
    commit_secondary: Option<Duration>,
    clean: Option<Duration>,
}

impl CommitProfile {
    pub fn start(&mut self) {
        self.mark = Some(Instant::now());
    }

    pub fn end_prewrite_primary(&mut self) {
        self.prewrite_primary = self.lap();
    }

    pub fn end_prewrite_secondary(&mut self) {
        self.prewrite_secondary = self.lap();
    }

    pub fn end_commit_primary(&mut self) {
        self.commit_primary = self.lap();
    }

    pub fn end_commit_secondary(&mut self) {
        self.commit_secondary = self.lap();
    }

    pub fn end_clean(&mut self) {
        self.clean = self.lap();
    }

    fn lap(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = self.mark.map(|m| now - m);
        self.mark = Some(now);
        elapsed
    }

    pub fn log(&self, txn_id: &TxnId) {
        tracing::debug!(
            "{} commit profile: prewrite primary {:?}, prewrite secondary {:?}, \
             commit primary {:?}, commit secondary {:?}, clean {:?}",
            txn_id,
            self.prewrite_primary,
            self.prewrite_secondary,
            self.commit_primary,
            self.commit_secondary,
            self.clean,
        );
    }
}
