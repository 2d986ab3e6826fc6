//! Core types for nzb-connect

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Unique identifier for a download job
///
/// Opaque to callers; generated as a UUIDv4 in simple (hyphen-free) form and
/// exposed verbatim as the SABnzbd `nzo_id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct DownloadId(pub String);

impl DownloadId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// View the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DownloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DownloadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Download job status
///
/// The machine is `queued → downloading → processing → {completed, failed}`,
/// with `failed` reachable from every non-terminal state. Terminal states
/// never transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting in the queue
    Queued,
    /// Segments are being fetched
    Downloading,
    /// Download finished, post-processing in progress
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error (includes user cancellation)
    Failed,
}

impl Status {
    /// Database string encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    /// Decode a database value; unknown strings decode to `Failed` so that
    /// corrupted rows surface visibly instead of re-entering the queue.
    pub fn from_db(s: &str) -> Self {
        match s {
            "queued" => Status::Queued,
            "downloading" => Status::Downloading,
            "processing" => Status::Processing,
            "completed" => Status::Completed,
            _ => Status::Failed,
        }
    }

    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Status::Failed) => true,
            (Status::Queued, Status::Downloading) => true,
            (Status::Downloading, Status::Processing) => true,
            (Status::Processing, Status::Completed) => true,
            _ => false,
        }
    }

    /// SABnzbd queue-slot status string (`Queued`/`Downloading`/`Extracting`)
    pub fn as_sabnzbd_queue(&self) -> &'static str {
        match self {
            Status::Queued => "Queued",
            Status::Downloading => "Downloading",
            Status::Processing => "Extracting",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
        }
    }

    /// SABnzbd history-slot status string (`Completed`/`Failed`)
    pub fn as_sabnzbd_history(&self) -> &'static str {
        match self {
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            other => other.as_sabnzbd_queue(),
        }
    }
}
