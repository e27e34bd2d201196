//! Duplicate-attendance guarding.
//!
//! Checked before any write. The read here is advisory only — the store's
//! uniqueness constraint on accepted `(student, session)` rows is what
//! actually closes the check-then-insert race under concurrent submissions.

use std::sync::Arc;

use crate::policy::ThresholdPolicy;
use crate::store::{AttendanceStore, StoreError};
use crate::types::LogRecord;

pub struct DuplicateGuard {
    policy: Arc<ThresholdPolicy>,
    store: Arc<dyn AttendanceStore>,
}

impl DuplicateGuard {
    pub fn new(policy: Arc<ThresholdPolicy>, store: Arc<dyn AttendanceStore>) -> Self {
        Self { policy, store }
    }

    /// Return the earlier accepted log, if one exists.
    ///
    /// With a session, any accepted mark for the pair counts. Without one,
    /// accepted marks inside the rolling duplicate window count.
    pub async fn existing_mark(
        &self,
        student_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<LogRecord>, StoreError> {
        match session_id {
            Some(session) => self.store.existing_accepted_log(student_id, session).await,
            None => {
                self.store
                    .last_accepted_log_within(student_id, self.policy.duplicate_window_seconds)
                    .await
            }
        }
    }
}
