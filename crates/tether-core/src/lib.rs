//! Tether: connection establishment for a peer-to-peer cluster.
//!
//! This crate is the transport-specific half of link setup between
//! cluster members: it binds the listening endpoint peers connect to,
//! accepts and admits inbound attempts, opens outbound connections to
//! named peers, and produces the fully-configured [`context::HandshakeContext`]
//! a separate, protocol-agnostic handshake engine drives to completion.
//! The handshake wire protocol, the directory service, and encryption
//! all live behind trait seams.
//!
//! # Architecture
//!
//! ```text
//!        ┌─────────────────────────────────┐
//!        │ tether-core                     │
//!        │ - listener / acceptor / connector │
//!        │ - controller handoff            │
//!        │ - handshake context builder     │
//!        │ - admission control             │
//!        └─────────────────────────────────┘
//!            ↓                      ↓
//!  ┌────────────────┐    ┌────────────────┐
//!  │ tether-tcp     │    │ tether-harness │
//!  │ (Tokio TCP)    │    │ (in-memory sim)│
//!  │ - production   │    │ - deterministic│
//!  └────────────────┘    └────────────────┘
//! ```
//!
//! # Key principles
//!
//! - One task per connection attempt; per-connection state is owned and
//!   transferred, never shared, so no connection ever waits on another.
//! - Socket ownership moves from the acceptor to the handler exactly
//!   once, atomically with respect to already-buffered inbound events.
//! - No ambient configuration: everything is passed in explicitly.
//!
//! # Modules
//!
//! - [`driver`]: transport driver abstraction
//! - [`directory`]: directory client abstraction + in-process default
//! - [`name`]: node-name parsing and naming modes
//! - [`config`]: typed configuration
//! - [`listener`]: endpoint binding, port scan, registration
//! - [`acceptor`]: accept loop and controller handoff
//! - [`connector`]: outbound connection setup
//! - [`context`]: per-connection handshake context
//! - [`admission`]: same-subnet admission control
//! - [`error`]: the failure taxonomy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod acceptor;
pub mod admission;
pub mod config;
pub mod connector;
pub mod context;
pub mod directory;
pub mod driver;
pub mod error;
pub mod listener;
pub mod name;

pub use config::LinkConfig;
pub use context::{ConnectionKind, HandshakeContext, HandshakeEngine};
pub use directory::{Creation, DirectoryClient, InMemoryDirectory};
pub use driver::{DriverSocket, TransportDriver};
pub use error::{AcceptError, AdmissionRefused, DriverError, OptionViolation, SetupError};
pub use listener::{listen, Endpoint};
pub use name::{NameError, NamingMode, NodeName};
