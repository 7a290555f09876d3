use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Creating,
    Starting,
    Sending,
    Waiting,
    Computing,
    Finished,
    Aborted,
    Timeout,
    Failed,
}

impl TaskStatus {
    pub fn is_preparing(&self) -> bool {
        matches!(self, TaskStatus::Creating | TaskStatus::Starting)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Sending
                | TaskStatus::Waiting
                | TaskStatus::Computing
                | TaskStatus::Starting
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Aborted | TaskStatus::Timeout | TaskStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Starting,
    Downloading,
    Verifying,
    Finished,
    Failure,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Starting | SubtaskStatus::Downloading | SubtaskStatus::Verifying
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SubtaskStatus::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_completed_are_disjoint() {
        for status in [
            TaskStatus::Creating,
            TaskStatus::Starting,
            TaskStatus::Sending,
            TaskStatus::Waiting,
            TaskStatus::Computing,
            TaskStatus::Finished,
            TaskStatus::Aborted,
            TaskStatus::Timeout,
            TaskStatus::Failed,
        ] {
            assert!(!(status.is_active() && status.is_completed()));
        }
    }

    #[test]
    fn subtask_active_excludes_terminal_states() {
        assert!(SubtaskStatus::Starting.is_active());
        assert!(!SubtaskStatus::Finished.is_active());
        assert!(!SubtaskStatus::Cancelled.is_active());
    }
}
