//! Protocol sniffing subsystem.
//!
//! # Data Flow
//! ```text
//! First bytes of a new connection
//!     → detect.rs (fixed-priority signature checks)
//!         HTTP → MySQL → PostgreSQL → MongoDB → Redis → RTMP
//!     → protocol.rs (Protocol enum, used as the sharding key everywhere)
//!     → Return: Protocol, or InsufficientData (buffer more and retry)
//! ```
//!
//! # Design Decisions
//! - Pure and stateless: safe to call from any number of tasks at once
//! - Fewer than 3 bytes is retryable; `Unknown` is definitive
//! - First matching check wins, so check order is part of the contract

pub mod detect;
pub mod protocol;

pub use detect::{InspectError, ProtocolInspector};
pub use protocol::{parse_protocol, Protocol};
