//! ICE candidates: types, priority computation and the SDP line codec.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Candidate type (RFC 8445 Section 5.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Address on a local interface
    Host,
    /// Learned from a STUN binding response
    ServerReflexive,
    /// Learned from an incoming connectivity check
    PeerReflexive,
    /// Allocated on a TURN server
    Relay,
}

impl CandidateType {
    /// Type preference used in the priority formula.
    pub fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    fn sdp_token(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    fn from_sdp_token(token: &str) -> Result<Self> {
        match token {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(Error::InvalidCandidate(format!(
                "unknown candidate type {other:?}"
            ))),
        }
    }
}

/// One ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Groups candidates from the same base and server
    pub foundation: String,
    /// Component id (1 = RTP, 2 = RTCP)
    pub component: u32,
    /// Transport protocol, lowercased ("udp")
    pub protocol: String,
    /// Candidate priority
    pub priority: u32,
    /// Transport address
    pub address: SocketAddr,
    /// Candidate type
    pub candidate_type: CandidateType,
    /// Base or server address for reflexive/relay candidates
    pub related_address: Option<SocketAddr>,
}

impl IceCandidate {
    /// Candidate priority per RFC 8445 Section 5.1.2.1:
    /// `(type_pref << 24) + (local_pref << 8) + (256 - component)`.
    pub fn compute_priority(
        candidate_type: CandidateType,
        local_preference: u32,
        component: u32,
    ) -> u32 {
        (candidate_type.preference() << 24) + (local_preference << 8) + (256 - component)
    }

    /// Build a host candidate on `address`.
    pub fn host(foundation: impl Into<String>, component: u32, address: SocketAddr) -> Self {
        Self {
            foundation: foundation.into(),
            component,
            protocol: "udp".to_string(),
            priority: Self::compute_priority(CandidateType::Host, 65535, component),
            address,
            candidate_type: CandidateType::Host,
            related_address: None,
        }
    }

    /// Build a server-reflexive candidate discovered through `base`.
    pub fn server_reflexive(
        foundation: impl Into<String>,
        component: u32,
        address: SocketAddr,
        base: SocketAddr,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            component,
            protocol: "udp".to_string(),
            priority: Self::compute_priority(CandidateType::ServerReflexive, 65535, component),
            address,
            candidate_type: CandidateType::ServerReflexive,
            related_address: Some(base),
        }
    }

    /// Build a relay candidate allocated at `relayed`, reachable via `server`.
    pub fn relay(
        foundation: impl Into<String>,
        component: u32,
        relayed: SocketAddr,
        server: SocketAddr,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            component,
            protocol: "udp".to_string(),
            priority: Self::compute_priority(CandidateType::Relay, 65535, component),
            address: relayed,
            candidate_type: CandidateType::Relay,
            related_address: Some(server),
        }
    }

    /// Render the `candidate:` SDP attribute line.
    pub fn to_sdp(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type.sdp_token(),
        );
        if self.candidate_type != CandidateType::Host {
            if let Some(related) = &self.related_address {
                line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
            }
        }
        line
    }

    /// Parse a `candidate:` SDP attribute line.
    pub fn from_sdp(line: &str) -> Result<Self> {
        let line = line.trim();
        let rest = line
            .strip_prefix("candidate:")
            .or_else(|| line.strip_prefix("a=candidate:"))
            .ok_or_else(|| Error::InvalidCandidate("missing candidate: prefix".to_string()))?;

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(Error::InvalidCandidate(format!("malformed line {line:?}")));
        }

        let bad = |what: &str| Error::InvalidCandidate(format!("bad {what} in {line:?}"));

        let foundation = fields[0].to_string();
        let component: u32 = fields[1].parse().map_err(|_| bad("component"))?;
        let protocol = fields[2].to_ascii_lowercase();
        let priority: u32 = fields[3].parse().map_err(|_| bad("priority"))?;
        let ip: std::net::IpAddr = fields[4].parse().map_err(|_| bad("address"))?;
        let port: u16 = fields[5].parse().map_err(|_| bad("port"))?;
        let candidate_type = CandidateType::from_sdp_token(fields[7])?;

        let mut related_address = None;
        let mut extra = fields[8..].iter();
        while let Some(token) = extra.next() {
            match *token {
                "raddr" => {
                    let rip: std::net::IpAddr = extra
                        .next()
                        .ok_or_else(|| bad("raddr"))?
                        .parse()
                        .map_err(|_| bad("raddr"))?;
                    let rport_token = extra.next().filter(|t| **t == "rport");
                    let rport: u16 = match rport_token {
                        Some(_) => extra
                            .next()
                            .ok_or_else(|| bad("rport"))?
                            .parse()
                            .map_err(|_| bad("rport"))?,
                        None => return Err(bad("rport")),
                    };
                    related_address = Some(SocketAddr::new(rip, rport));
                }
                // Unknown extension tokens come in pairs
                _ => {
                    extra.next();
                }
            }
        }

        Ok(Self {
            foundation,
            component,
            protocol,
            priority,
            address: SocketAddr::new(ip, port),
            candidate_type,
            related_address,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sdp())
    }
}

/// Pair priority per RFC 8445 Section 6.1.2.3:
/// `2^32 * min(G, D) + 2 * max(G, D) + (G > D ? 1 : 0)`
/// where G is the controlling side's candidate priority.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = controlling as u64;
    let d = controlled as u64;
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_by_type() {
        let addr: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let host = IceCandidate::host("1", 1, addr);
        let srflx = IceCandidate::server_reflexive("2", 1, addr, addr);
        let relay = IceCandidate::relay("3", 1, addr, addr);

        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
    }

    #[test]
    fn test_priority_formula() {
        let p = IceCandidate::compute_priority(CandidateType::Host, 65535, 1);
        assert_eq!(p, (126 << 24) + (65535 << 8) + 255);
    }

    #[test]
    fn test_component_lowers_priority() {
        let rtp = IceCandidate::compute_priority(CandidateType::Host, 65535, 1);
        let rtcp = IceCandidate::compute_priority(CandidateType::Host, 65535, 2);
        assert_eq!(rtp - rtcp, 1);
    }

    #[test]
    fn test_sdp_round_trip_host() {
        let candidate = IceCandidate::host("784033295", 1, "10.1.2.3:54321".parse().unwrap());
        let line = candidate.to_sdp();
        assert!(line.starts_with("candidate:784033295 1 udp"));
        assert!(line.ends_with("typ host"));

        let parsed = IceCandidate::from_sdp(&line).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_sdp_round_trip_srflx_with_raddr() {
        let candidate = IceCandidate::server_reflexive(
            "98765",
            1,
            "203.0.113.5:61000".parse().unwrap(),
            "10.0.0.9:54000".parse().unwrap(),
        );
        let line = candidate.to_sdp();
        assert!(line.contains("typ srflx raddr 10.0.0.9 rport 54000"));

        let parsed = IceCandidate::from_sdp(&line).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_sdp_accepts_attribute_prefix() {
        let parsed =
            IceCandidate::from_sdp("a=candidate:1 1 udp 2130706431 192.168.1.5 5000 typ host")
                .unwrap();
        assert_eq!(parsed.candidate_type, CandidateType::Host);
        assert_eq!(parsed.address, "192.168.1.5:5000".parse().unwrap());
    }

    #[test]
    fn test_sdp_rejects_garbage() {
        assert!(IceCandidate::from_sdp("not a candidate").is_err());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp nope 1.2.3.4 5 typ host").is_err());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp 1 1.2.3.4 5 typ alien").is_err());
    }

    #[test]
    fn test_pair_priority_symmetry_rules() {
        // min goes to the high word regardless of which side holds it
        assert_eq!(pair_priority(100, 200) >> 32, 100);
        assert_eq!(pair_priority(200, 100) >> 32, 100);
        // Tiebreak bit favours the controlling side
        assert_eq!(pair_priority(200, 100) & 1, 1);
        assert_eq!(pair_priority(100, 200) & 1, 0);
    }
}
