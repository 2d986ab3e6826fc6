//! Tunnel connector contract
//!
//! In managed mode the coordinator owns a [`TunnelConnector`] that brings
//! the tunnel up and down by driving external userland tooling. This crate
//! defines only the contract; concrete WireGuard/OpenVPN connectors live
//! with the embedding application.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Connector lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorState {
    /// No tunnel
    Disconnected,
    /// Bring-up in progress
    Connecting,
    /// Tunnel established
    Connected,
    /// Last attempt failed
    Error,
    /// Automatic reconnection in progress
    Reconnecting,
}

/// Snapshot of a connector's state for the status API
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ConnectorStatus {
    /// Lifecycle state
    pub state: ConnectorState,
    /// Interface name of the tunnel, when one exists
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interface_name: String,
    /// Last error message, when in the error state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the tunnel came up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectorStatus {
    /// A plain disconnected status
    pub fn disconnected() -> Self {
        Self {
            state: ConnectorState::Disconnected,
            interface_name: String::new(),
            error: None,
            connected_at: None,
        }
    }
}

/// Brings a VPN tunnel up and down on behalf of the coordinator
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Establish the tunnel; returns the created interface name.
    ///
    /// Must observe `cancel` and unwind promptly when it fires (the
    /// coordinator cancels in-progress connects on shutdown).
    async fn connect(&self, cancel: &CancellationToken) -> Result<String>;

    /// Tear the tunnel down. Called on stale state before reconnecting,
    /// so it must tolerate a tunnel that is already gone.
    async fn disconnect(&self) -> Result<()>;

    /// Current state for the status API
    fn status(&self) -> ConnectorStatus;
}
