//! Agent configuration, roles and credentials.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// ICE role. Exactly one side of a session controls nomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceRole {
    /// Chooses the pair to nominate
    Controlling,
    /// Follows the controlling side's nomination
    Controlled,
}

/// Short-term credentials exchanged in signalling.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCredentials {
    /// Username fragment (ufrag)
    pub ufrag: String,
    /// Password used to key MESSAGE-INTEGRITY
    pub password: String,
}

impl IceCredentials {
    /// Generate fresh credentials: 8-char ufrag, 24-char password.
    pub fn generate() -> Self {
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let mut pick = |len: usize| -> String {
            (0..len)
                .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
                .collect()
        };
        Self {
            ufrag: pick(8),
            password: pick(24),
        }
    }
}

/// STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server address as `host:port`
    pub address: String,
    /// TURN username, when the entry is a TURN server
    pub username: Option<String>,
    /// TURN password
    pub password: Option<String>,
}

impl IceServerConfig {
    /// A STUN server entry.
    pub fn stun(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: None,
            password: None,
        }
    }

    /// A TURN server entry with long-term credentials.
    pub fn turn(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

/// Agent tunables.
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// STUN servers for server-reflexive gathering
    pub stun_servers: Vec<IceServerConfig>,
    /// TURN servers for relay gathering
    pub turn_servers: Vec<IceServerConfig>,
    /// Gather host candidates from local interfaces
    pub gather_host: bool,
    /// Interval between connectivity checks
    pub connectivity_check_interval: Duration,
    /// Interval between keepalives on the selected pair
    pub keepalive_interval: Duration,
    /// Deadline for a nomination after the check list drains
    pub nomination_timeout: Duration,
    /// Overall gathering deadline
    pub gathering_timeout: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            gather_host: true,
            connectivity_check_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(15),
            nomination_timeout: Duration::from_secs(30),
            gathering_timeout: Duration::from_secs(5),
        }
    }
}
