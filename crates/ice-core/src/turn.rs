//! TURN client (RFC 5766 subset): Allocate, Refresh, CreatePermission,
//! ChannelBind, Send/Data indications and ChannelData framing.
//!
//! The client does not own its socket; the I/O layer hands it a handle and
//! feeds incoming datagrams through [`TurnClient::process_packet`]. Request
//! completion is observed through the event channel and [`TurnClient::state`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::stun::{StunAttribute, StunClass, StunMessage, StunMethod};
use crate::Result;

/// UDP transport code for REQUESTED-TRANSPORT.
const TRANSPORT_UDP: u8 = 17;

/// First channel number usable for ChannelBind (RFC 5766 Section 11).
const CHANNEL_MIN: u16 = 0x4000;
/// Last usable channel number.
const CHANNEL_MAX: u16 = 0x7FFF;

/// TURN client configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server address
    pub server: SocketAddr,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
    /// Requested allocation lifetime in seconds
    pub lifetime_secs: u32,
}

/// Client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No allocation
    Idle,
    /// Allocate request in flight
    Allocating,
    /// Allocation live
    Allocated,
    /// Refresh request in flight
    Refreshing,
    /// Allocation lost or refused
    Failed,
}

/// A live allocation on the TURN server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnAllocation {
    /// Relayed transport address peers send to
    pub relayed_address: SocketAddr,
    /// Our reflexive address as the server saw it
    pub mapped_address: Option<SocketAddr>,
    /// Granted lifetime in seconds
    pub lifetime_secs: u32,
}

/// Events emitted as server responses arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Allocation succeeded
    Allocated(TurnAllocation),
    /// Allocation or refresh failed
    AllocationFailed {
        /// STUN error code, zero when the failure was local
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// Permission installed for a peer
    PermissionCreated(SocketAddr),
    /// Channel bound to a peer
    ChannelBound {
        /// The peer the channel reaches
        peer: SocketAddr,
        /// Bound channel number
        channel: u16,
    },
    /// Relayed application data from a peer
    Data {
        /// Originating peer
        peer: SocketAddr,
        /// Payload
        data: Bytes,
    },
}

enum PendingRequest {
    Allocate,
    Refresh,
    CreatePermission(SocketAddr),
    ChannelBind { peer: SocketAddr, channel: u16 },
}

/// TURN client over a shared UDP socket handle.
pub struct TurnClient {
    socket: Arc<UdpSocket>,
    config: TurnConfig,
    state: TurnState,
    allocation: Option<TurnAllocation>,

    realm: Option<String>,
    nonce: Option<String>,

    pending: HashMap<[u8; 12], PendingRequest>,
    channels: HashMap<SocketAddr, u16>,
    next_channel: u16,

    events: mpsc::Sender<TurnEvent>,
}

impl TurnClient {
    /// Create a client using `socket` to reach the configured server.
    pub fn new(
        socket: Arc<UdpSocket>,
        config: TurnConfig,
    ) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (events, events_rx) = mpsc::channel(32);
        (
            Self {
                socket,
                config,
                state: TurnState::Idle,
                allocation: None,
                realm: None,
                nonce: None,
                pending: HashMap::new(),
                channels: HashMap::new(),
                next_channel: CHANNEL_MIN,
                events,
            },
            events_rx,
        )
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Live allocation, if any.
    pub fn allocation(&self) -> Option<&TurnAllocation> {
        self.allocation.as_ref()
    }

    /// Relayed address of the live allocation.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.allocation.as_ref().map(|a| a.relayed_address)
    }

    /// Long-term credential key: MD5 of `username:realm:password`.
    fn auth_key(&self, realm: &str) -> Vec<u8> {
        let mut hasher = Md5::new();
        hasher.update(self.config.username.as_bytes());
        hasher.update(b":");
        hasher.update(realm.as_bytes());
        hasher.update(b":");
        hasher.update(self.config.password.as_bytes());
        hasher.finalize().to_vec()
    }

    fn add_auth(&self, msg: &mut StunMessage) {
        if let (Some(realm), Some(nonce)) = (&self.realm, &self.nonce) {
            msg.add_attribute(StunAttribute::Username(self.config.username.clone()));
            msg.add_attribute(StunAttribute::Realm(realm.clone()));
            msg.add_attribute(StunAttribute::Nonce(nonce.clone()));
            msg.add_message_integrity(&self.auth_key(realm));
        }
    }

    async fn send(&self, msg: &StunMessage) -> Result<()> {
        self.socket
            .send_to(&msg.serialize(), self.config.server)
            .await?;
        Ok(())
    }

    /// Request an allocation. Completion arrives as a [`TurnEvent`].
    pub async fn allocate(&mut self) -> Result<()> {
        let mut msg = StunMessage::new(StunClass::Request, StunMethod::Allocate);
        msg.add_attribute(StunAttribute::RequestedTransport(TRANSPORT_UDP));
        msg.add_attribute(StunAttribute::Lifetime(self.config.lifetime_secs));
        self.add_auth(&mut msg);

        self.pending
            .insert(msg.transaction_id, PendingRequest::Allocate);
        self.state = TurnState::Allocating;
        self.send(&msg).await
    }

    /// Refresh the allocation; `lifetime_secs` of zero deallocates.
    pub async fn refresh(&mut self, lifetime_secs: u32) -> Result<()> {
        if self.allocation.is_none() {
            return Err(Error::InvalidState("no allocation to refresh".to_string()));
        }
        let mut msg = StunMessage::new(StunClass::Request, StunMethod::Refresh);
        msg.add_attribute(StunAttribute::Lifetime(lifetime_secs));
        self.add_auth(&mut msg);

        self.pending
            .insert(msg.transaction_id, PendingRequest::Refresh);
        self.state = TurnState::Refreshing;
        self.send(&msg).await
    }

    /// Release the allocation.
    pub async fn deallocate(&mut self) -> Result<()> {
        let result = self.refresh(0).await;
        self.allocation = None;
        self.channels.clear();
        self.state = TurnState::Idle;
        result
    }

    /// Install a permission so `peer` may send to our relayed address.
    pub async fn create_permission(&mut self, peer: SocketAddr) -> Result<()> {
        if self.allocation.is_none() {
            return Err(Error::InvalidState("no allocation".to_string()));
        }
        let mut msg = StunMessage::new(StunClass::Request, StunMethod::CreatePermission);
        msg.add_attribute(StunAttribute::XorPeerAddress(peer));
        self.add_auth(&mut msg);

        self.pending
            .insert(msg.transaction_id, PendingRequest::CreatePermission(peer));
        self.send(&msg).await
    }

    /// Bind a channel to `peer` for compact relaying.
    pub async fn bind_channel(&mut self, peer: SocketAddr) -> Result<u16> {
        if self.allocation.is_none() {
            return Err(Error::InvalidState("no allocation".to_string()));
        }
        if let Some(channel) = self.channels.get(&peer) {
            return Ok(*channel);
        }
        if self.next_channel > CHANNEL_MAX {
            return Err(Error::IceError("channel numbers exhausted".to_string()));
        }
        let channel = self.next_channel;
        self.next_channel += 1;

        let mut msg = StunMessage::new(StunClass::Request, StunMethod::ChannelBind);
        msg.add_attribute(StunAttribute::ChannelNumber(channel));
        msg.add_attribute(StunAttribute::XorPeerAddress(peer));
        self.add_auth(&mut msg);

        self.pending
            .insert(msg.transaction_id, PendingRequest::ChannelBind { peer, channel });
        self.send(&msg).await?;
        Ok(channel)
    }

    /// Relay application data to `peer` through the allocation.
    ///
    /// Uses ChannelData framing when a channel is bound, otherwise a Send
    /// indication.
    pub async fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        if self.state != TurnState::Allocated {
            return Err(Error::InvalidState("no allocation".to_string()));
        }

        if let Some(channel) = self.channels.get(&peer) {
            let mut frame = BytesMut::with_capacity(4 + data.len());
            frame.put_u16(*channel);
            frame.put_u16(data.len() as u16);
            frame.put_slice(data);
            self.socket.send_to(&frame, self.config.server).await?;
        } else {
            let mut msg = StunMessage::new(StunClass::Indication, StunMethod::Send);
            msg.add_attribute(StunAttribute::XorPeerAddress(peer));
            msg.add_attribute(StunAttribute::Data(Bytes::copy_from_slice(data)));
            self.send(&msg).await?;
        }
        Ok(())
    }

    /// Process a datagram received from the TURN server.
    ///
    /// Returns `true` when the packet was consumed (STUN response, Data
    /// indication or ChannelData), `false` when it is not TURN traffic.
    pub async fn process_packet(&mut self, data: &[u8], source: SocketAddr) -> Result<bool> {
        if source != self.config.server {
            return Ok(false);
        }

        // ChannelData frames start with the channel number
        if data.len() >= 4 {
            let channel = u16::from_be_bytes([data[0], data[1]]);
            if (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
                let len = u16::from_be_bytes([data[2], data[3]]) as usize;
                if data.len() < 4 + len {
                    return Err(Error::BufferTooSmall {
                        required: 4 + len,
                        available: data.len(),
                    });
                }
                if let Some((peer, _)) = self.channels.iter().find(|(_, c)| **c == channel) {
                    let event = TurnEvent::Data {
                        peer: *peer,
                        data: Bytes::copy_from_slice(&data[4..4 + len]),
                    };
                    let _ = self.events.send(event).await;
                } else {
                    warn!(channel, "ChannelData on unbound channel");
                }
                return Ok(true);
            }
        }

        if !StunMessage::is_stun(data) {
            return Ok(false);
        }
        let msg = StunMessage::parse(data)?;

        // Data indication: relayed traffic from a peer
        if msg.class == StunClass::Indication && msg.method == StunMethod::Data {
            let peer = msg.attribute(|a| match a {
                StunAttribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            });
            let payload = msg.attribute(|a| match a {
                StunAttribute::Data(d) => Some(d.clone()),
                _ => None,
            });
            if let (Some(peer), Some(data)) = (peer, payload) {
                let _ = self.events.send(TurnEvent::Data { peer, data }).await;
            }
            return Ok(true);
        }

        let Some(request) = self.pending.remove(&msg.transaction_id) else {
            debug!("STUN response with unknown transaction id");
            return Ok(true);
        };

        match msg.class {
            StunClass::SuccessResponse => self.on_success(request, &msg).await,
            StunClass::ErrorResponse => self.on_error(request, &msg).await?,
            _ => {}
        }
        Ok(true)
    }

    async fn on_success(&mut self, request: PendingRequest, msg: &StunMessage) {
        match request {
            PendingRequest::Allocate => {
                let relayed = msg.xor_relayed_address();
                let lifetime = msg
                    .attribute(|a| match a {
                        StunAttribute::Lifetime(secs) => Some(*secs),
                        _ => None,
                    })
                    .unwrap_or(self.config.lifetime_secs);

                if let Some(relayed_address) = relayed {
                    let allocation = TurnAllocation {
                        relayed_address,
                        mapped_address: msg.xor_mapped_address(),
                        lifetime_secs: lifetime,
                    };
                    debug!(%relayed_address, lifetime, "TURN allocation created");
                    self.allocation = Some(allocation.clone());
                    self.state = TurnState::Allocated;
                    let _ = self.events.send(TurnEvent::Allocated(allocation)).await;
                } else {
                    self.state = TurnState::Failed;
                    let _ = self
                        .events
                        .send(TurnEvent::AllocationFailed {
                            code: 0,
                            reason: "allocate response without relayed address".to_string(),
                        })
                        .await;
                }
            }
            PendingRequest::Refresh => {
                if let Some(allocation) = &mut self.allocation {
                    if let Some(secs) = msg.attribute(|a| match a {
                        StunAttribute::Lifetime(secs) => Some(*secs),
                        _ => None,
                    }) {
                        allocation.lifetime_secs = secs;
                    }
                }
                self.state = TurnState::Allocated;
            }
            PendingRequest::CreatePermission(peer) => {
                let _ = self.events.send(TurnEvent::PermissionCreated(peer)).await;
            }
            PendingRequest::ChannelBind { peer, channel } => {
                self.channels.insert(peer, channel);
                let _ = self
                    .events
                    .send(TurnEvent::ChannelBound { peer, channel })
                    .await;
            }
        }
    }

    async fn on_error(&mut self, request: PendingRequest, msg: &StunMessage) -> Result<()> {
        let (code, reason) = msg
            .error_code()
            .map(|(c, r)| (c, r.to_string()))
            .unwrap_or((0, "error response without ERROR-CODE".to_string()));

        // 401 with a fresh realm/nonce: retry the request authenticated
        if code == 401 && self.realm.is_none() {
            let realm = msg.attribute(|a| match a {
                StunAttribute::Realm(r) => Some(r.clone()),
                _ => None,
            });
            let nonce = msg.attribute(|a| match a {
                StunAttribute::Nonce(n) => Some(n.clone()),
                _ => None,
            });
            if let (Some(realm), Some(nonce)) = (realm, nonce) {
                debug!(%realm, "TURN authentication challenge, retrying");
                self.realm = Some(realm);
                self.nonce = Some(nonce);
                match request {
                    PendingRequest::Allocate => return self.allocate().await,
                    PendingRequest::Refresh => {
                        return self.refresh(self.config.lifetime_secs).await
                    }
                    PendingRequest::CreatePermission(peer) => {
                        return self.create_permission(peer).await
                    }
                    PendingRequest::ChannelBind { peer, .. } => {
                        return self.bind_channel(peer).await.map(|_| ());
                    }
                }
            }
        }

        warn!(code, %reason, "TURN request failed");
        match request {
            PendingRequest::Allocate | PendingRequest::Refresh => {
                self.state = TurnState::Failed;
                let _ = self
                    .events
                    .send(TurnEvent::AllocationFailed { code, reason })
                    .await;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Arc<UdpSocket>, UdpSocket, SocketAddr) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (client, server, server_addr)
    }

    fn config(server: SocketAddr) -> TurnConfig {
        TurnConfig {
            server,
            username: "alice".to_string(),
            password: "secret".to_string(),
            lifetime_secs: 600,
        }
    }

    #[tokio::test]
    async fn test_allocate_retries_after_401_then_succeeds() {
        let (client_socket, server, server_addr) = pair().await;
        let socket = Arc::clone(&client_socket);
        let (mut client, mut events) = TurnClient::new(client_socket, config(server_addr));

        client.allocate().await.unwrap();
        assert_eq!(client.state(), TurnState::Allocating);

        // First request is unauthenticated; answer 401 with realm/nonce
        let mut buf = [0u8; 1500];
        let (n, client_addr) = server.recv_from(&mut buf).await.unwrap();
        let request = StunMessage::parse(&buf[..n]).unwrap();
        assert_eq!(request.method, StunMethod::Allocate);

        let mut challenge = StunMessage {
            class: StunClass::ErrorResponse,
            method: StunMethod::Allocate,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        };
        challenge.add_attribute(StunAttribute::ErrorCode {
            code: 401,
            reason: "Unauthorized".to_string(),
        });
        challenge.add_attribute(StunAttribute::Realm("confero.test".to_string()));
        challenge.add_attribute(StunAttribute::Nonce("abc123".to_string()));
        server
            .send_to(&challenge.serialize(), client_addr)
            .await
            .unwrap();

        // Client processes the challenge and retries with credentials
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        client.process_packet(&buf[..n], from).await.unwrap();

        let (n, client_addr) = server.recv_from(&mut buf).await.unwrap();
        let retry_raw = buf[..n].to_vec();
        let retry = StunMessage::parse(&retry_raw).unwrap();
        assert!(retry
            .attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::Username(u) if u == "alice")));

        // Integrity is keyed with MD5(user:realm:pass)
        let mut hasher = Md5::new();
        hasher.update(b"alice:confero.test:secret");
        let key = hasher.finalize();
        StunMessage::verify_message_integrity(&retry_raw, &key).unwrap();

        // Grant the allocation
        let relayed: SocketAddr = "198.51.100.10:49170".parse().unwrap();
        let mut grant = StunMessage {
            class: StunClass::SuccessResponse,
            method: StunMethod::Allocate,
            transaction_id: retry.transaction_id,
            attributes: Vec::new(),
        };
        grant.add_attribute(StunAttribute::XorRelayedAddress(relayed));
        grant.add_attribute(StunAttribute::Lifetime(300));
        server.send_to(&grant.serialize(), client_addr).await.unwrap();

        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        client.process_packet(&buf[..n], from).await.unwrap();

        assert_eq!(client.state(), TurnState::Allocated);
        assert_eq!(client.relayed_address(), Some(relayed));
        match events.recv().await {
            Some(TurnEvent::Allocated(allocation)) => {
                assert_eq!(allocation.lifetime_secs, 300);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_uses_indication_without_channel() {
        let (client_socket, server, server_addr) = pair().await;
        let (mut client, _events) = TurnClient::new(client_socket, config(server_addr));

        // Fake an allocation so send_to is allowed
        client.state = TurnState::Allocated;
        client.allocation = Some(TurnAllocation {
            relayed_address: "198.51.100.10:49170".parse().unwrap(),
            mapped_address: None,
            lifetime_secs: 600,
        });

        let peer: SocketAddr = "192.0.2.50:7000".parse().unwrap();
        client.send_to(b"hello", peer).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let msg = StunMessage::parse(&buf[..n]).unwrap();
        assert_eq!(msg.class, StunClass::Indication);
        assert_eq!(msg.method, StunMethod::Send);
        assert_eq!(
            msg.attribute(|a| match a {
                StunAttribute::Data(d) => Some(d.clone()),
                _ => None,
            }),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn test_channel_data_framing_round_trip() {
        let (client_socket, server, server_addr) = pair().await;
        let (mut client, mut events) = TurnClient::new(client_socket, config(server_addr));

        client.state = TurnState::Allocated;
        client.allocation = Some(TurnAllocation {
            relayed_address: "198.51.100.10:49170".parse().unwrap(),
            mapped_address: None,
            lifetime_secs: 600,
        });

        let peer: SocketAddr = "192.0.2.50:7000".parse().unwrap();
        client.channels.insert(peer, 0x4000);

        client.send_to(b"payload", peer).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &0x4000u16.to_be_bytes());
        assert_eq!(&buf[4..n], b"payload");

        // Inbound ChannelData surfaces as a Data event
        let mut frame = BytesMut::new();
        frame.put_u16(0x4000);
        frame.put_u16(4);
        frame.put_slice(b"pong");
        let consumed = client
            .process_packet(&frame, server_addr)
            .await
            .unwrap();
        assert!(consumed);
        assert_eq!(
            events.recv().await,
            Some(TurnEvent::Data {
                peer,
                data: Bytes::from_static(b"pong"),
            })
        );
    }
}
