//! # nzb-connect
//!
//! A Usenet (NNTP) download agent that accepts NZB job descriptors through a
//! SABnzbd-compatible HTTP control plane, fetches article bodies across a
//! pool of authenticated NNTP connections bound to a VPN network interface,
//! decodes the yEnc payloads, reassembles the original files, and extracts
//! the resulting archives into a completion directory.
//!
//! The agent pauses itself when the VPN interface disappears and resumes
//! when it returns; connections are never reused across an interface change.
//!
//! ## Components
//!
//! - [`nzb`] — NZB descriptor parsing (files, segments, password metadata)
//! - [`yenc`] — yEnc article decoding with CRC32 verification
//! - [`nntp`] — interface-bound dialer, NNTP sessions, per-server pools,
//!   and the cross-server pool manager
//! - [`vpn`] — interface monitoring and tunnel lifecycle coordination
//! - [`queue`] — SQLite-backed job queue and history
//! - [`engine`] — the download engine: segment fan-out and file assembly
//! - [`postprocess`] — archive extraction into the completion directory
//! - [`api`] — SABnzbd-compatible control plane plus admin endpoints

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP control plane (SABnzbd emulation and admin endpoints)
pub mod api;
/// Configuration types and the shared runtime config
pub mod config;
/// Download engine
pub mod engine;
/// Error types
pub mod error;
/// NNTP subsystem: dialer, sessions, pools, pool manager
pub mod nntp;
/// NZB descriptor parser
pub mod nzb;
/// Archive extraction and completion handling
pub mod postprocess;
/// Persistent job queue
pub mod queue;
/// Core identifiers and the job status machine
pub mod types;
/// VPN interface monitoring and tunnel coordination
pub mod vpn;
/// yEnc codec
pub mod yenc;

pub use config::{Config, ServerConfig, SharedConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use nntp::PoolManager;
pub use queue::QueueStore;
pub use types::{DownloadId, Status};
pub use vpn::VpnManager;
