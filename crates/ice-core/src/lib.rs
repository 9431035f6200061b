//! # ICE connectivity for the Confero media engine
//!
//! Candidate gathering (host, server-reflexive via STUN, relayed via TURN),
//! pair prioritisation and the connectivity-check state machine of RFC 8445,
//! plus the STUN message codec everything rides on.
//!
//! The agent owns no sockets beyond the ones the I/O layer hands it for
//! gathering; incoming packets are pushed in via [`IceAgent::process_packet`]
//! and outgoing traffic leaves through the same socket handles.

pub mod agent;
pub mod candidate;
pub mod config;
pub mod error;
pub mod stun;
pub mod turn;

pub use agent::{IceAgent, IceAgentEvent, IceConnectionState, IceGatheringState};
pub use candidate::{CandidateType, IceCandidate};
pub use config::{IceConfig, IceCredentials, IceRole};
pub use error::Error;
pub use stun::{StunClass, StunMessage, StunMethod};
pub use turn::{TurnClient, TurnConfig};

/// Result type for ICE operations
pub type Result<T> = std::result::Result<T, Error>;
