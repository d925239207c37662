use serde::{Deserialize, Serialize};

/// FolderStatus tracks a folder through its preprocessing lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolderStatus {
    #[sqlx(rename = "NOT_PROCESSED")]
    NotProcessed,
    #[sqlx(rename = "PREPROCESSING")]
    Preprocessing,
    #[sqlx(rename = "READY")]
    Ready,
    #[sqlx(rename = "ERROR")]
    Error,
}

/// BatchStatus is the control-plane state of a batch. Transitions are
/// enforced by `may_transition` and mirrored as conditional UPDATEs in SQL.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    #[sqlx(rename = "SAVED")]
    Saved,
    #[sqlx(rename = "STAGING")]
    Staging,
    #[sqlx(rename = "STAGED")]
    Staged,
    #[sqlx(rename = "FAILED_STAGING")]
    FailedStaging,
    #[sqlx(rename = "ANALYZING")]
    Analyzing,
    #[sqlx(rename = "COMPLETED")]
    Completed,
}

impl BatchStatus {
    /// Whether the edge `from` -> `to` is legal.
    ///
    /// Reset (any -> Saved) is always legal: it is the user's escape hatch.
    pub fn may_transition(from: BatchStatus, to: BatchStatus) -> bool {
        use BatchStatus::*;
        match (from, to) {
            (_, Saved) => true,
            (Saved, Staging) => true,
            (Staging, Staged) | (Staging, FailedStaging) => true,
            (Staged, Analyzing) => true,
            (Analyzing, Completed) => true,
            _ => false,
        }
    }
}

/// ResponseStatus is the work-store state of a single unit of LLM work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    #[sqlx(rename = "QUEUED")]
    Queued,
    #[sqlx(rename = "PROCESSING")]
    Processing,
    #[sqlx(rename = "COMPLETED")]
    Completed,
    #[sqlx(rename = "FAILED")]
    Failed,
    #[sqlx(rename = "TIMEOUT")]
    Timeout,
}

impl ResponseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResponseStatus::Completed | ResponseStatus::Failed | ResponseStatus::Timeout
        )
    }
}

/// ConnectionState is the last observed reachability of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[sqlx(rename = "unknown")]
    Unknown,
    #[sqlx(rename = "connected")]
    Connected,
    #[sqlx(rename = "failed")]
    Failed,
}

/// Validity of a scanned document. Invalid documents must never appear in a
/// batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Validity {
    #[sqlx(rename = "Y")]
    #[serde(rename = "Y")]
    Valid,
    #[sqlx(rename = "N")]
    #[serde(rename = "N")]
    Invalid,
}

#[cfg(test)]
mod test {
    use super::*;
    use BatchStatus::*;

    #[test]
    fn legal_batch_edges() {
        assert!(BatchStatus::may_transition(Saved, Staging));
        assert!(BatchStatus::may_transition(Staging, Staged));
        assert!(BatchStatus::may_transition(Staging, FailedStaging));
        assert!(BatchStatus::may_transition(Staged, Analyzing));
        assert!(BatchStatus::may_transition(Analyzing, Completed));
    }

    #[test]
    fn reset_is_legal_from_every_state() {
        for from in [Saved, Staging, Staged, FailedStaging, Analyzing, Completed] {
            assert!(BatchStatus::may_transition(from, Saved));
        }
    }

    #[test]
    fn illegal_batch_edges() {
        assert!(!BatchStatus::may_transition(Saved, Analyzing));
        assert!(!BatchStatus::may_transition(Staged, Completed));
        assert!(!BatchStatus::may_transition(Completed, Analyzing));
        assert!(!BatchStatus::may_transition(FailedStaging, Staged));
    }

    #[test]
    fn terminal_response_states() {
        assert!(!ResponseStatus::Queued.is_terminal());
        assert!(!ResponseStatus::Processing.is_terminal());
        assert!(ResponseStatus::Completed.is_terminal());
        assert!(ResponseStatus::Failed.is_terminal());
        assert!(ResponseStatus::Timeout.is_terminal());
    }

    #[test]
    fn statuses_serialize_as_database_literals() {
        assert_eq!(
            serde_json::to_string(&BatchStatus::FailedStaging).unwrap(),
            r#""FAILED_STAGING""#
        );
        assert_eq!(
            serde_json::to_string(&FolderStatus::NotProcessed).unwrap(),
            r#""NOT_PROCESSED""#
        );
        assert_eq!(serde_json::to_string(&Validity::Valid).unwrap(), r#""Y""#);
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            r#""connected""#
        );
    }
}
