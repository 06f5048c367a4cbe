//! Client-side state machine: connect-token lifetime, the connection-request
//! / challenge-response handshake, server-address failover, and the 10 Hz
//! send cadence.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::net::SocketAddr;

use tracing::{debug, trace};

use super::bytes::Bytes;
use super::error::{Error, Result};
use super::packet::{
    DisconnectPacket, KeepAlivePacket, Packet, PayloadPacket, RequestPacket, ResponsePacket,
};
use super::replay::ReplayProtection;
use super::token::{ChallengeToken, ConnectToken};
use super::transport::Transport;
use super::{ClientId, MAX_PACKET_SIZE, MAX_PKT_BUF_SIZE, PACKET_SEND_RATE_SEC};

type Callback<Ctx> = Box<dyn FnMut(ClientState, ClientState, &mut Ctx) + Send + Sync + 'static>;

pub struct ClientConfig<Ctx> {
    num_disconnect_packets: usize,
    packet_send_rate: f64,
    context: Ctx,
    on_state_change: Option<Callback<Ctx>>,
}

impl Default for ClientConfig<()> {
    fn default() -> Self {
        Self::with_context(())
    }
}

impl<Ctx> ClientConfig<Ctx> {
    pub fn with_context(context: Ctx) -> Self {
        Self {
            num_disconnect_packets: super::NUM_DISCONNECT_PACKETS,
            packet_send_rate: PACKET_SEND_RATE_SEC,
            context,
            on_state_change: None,
        }
    }

    pub fn num_disconnect_packets(mut self, n: usize) -> Self {
        self.num_disconnect_packets = n;
        self
    }

    pub fn packet_send_rate(mut self, seconds: f64) -> Self {
        self.packet_send_rate = seconds;
        self
    }

    pub fn on_state_change<F>(mut self, cb: F) -> Self
    where
        F: FnMut(ClientState, ClientState, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(cb));
        self
    }
}

/// Totally ordered for bookkeeping; negative-valued variants (by discriminant
/// order, not literal numeric value) are terminal failure states reached
/// only from [`Client::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    /// `TokenExpired(-6)`
    TokenExpired,
    /// `InvalidToken(-5)`
    InvalidToken,
    /// `ConnectionTimeout(-4)`
    ConnectionTimeout,
    /// `ResponseTimeout(-3)`
    ResponseTimeout,
    /// `RequestTimeout(-2)`
    RequestTimeout,
    /// `ConnectionDenied(-1)`
    ConnectionDenied,
    /// `Disconnected(0)`
    Disconnected,
    /// `SendingRequest(1)`
    SendingRequest,
    /// `SendingResponse(2)`
    SendingResponse,
    /// `Connected(3)`
    Connected,
}

impl ClientState {
    pub fn is_error(self) -> bool {
        self < ClientState::Disconnected
    }

    pub fn is_connected(self) -> bool {
        self == ClientState::Connected
    }

    pub fn is_pending(self) -> bool {
        matches!(self, ClientState::SendingRequest | ClientState::SendingResponse)
    }
}

const ALLOWED_PACKETS: u8 = (1 << Packet::DENIED)
    | (1 << Packet::CHALLENGE)
    | (1 << Packet::KEEP_ALIVE)
    | (1 << Packet::PAYLOAD)
    | (1 << Packet::DISCONNECT);

/// A netcode client driving one connect token through the handshake to a
/// connected session, with automatic failover across the token's listed
/// server addresses.
pub struct Client<Ctx = ()> {
    id: ClientId,
    state: ClientState,
    time: f64,
    connect_start_time: f64,
    last_send_time: f64,
    last_receive_time: f64,
    server_addr_idx: usize,
    sequence: u64,
    challenge_sequence: u64,
    challenge_token_data: [u8; ChallengeToken::SIZE],
    token: ConnectToken,
    replay_protection: ReplayProtection,
    max_clients: u32,
    should_disconnect: bool,
    should_disconnect_state: ClientState,
    receive_queue: VecDeque<Vec<u8>>,
    loopback: bool,
    cfg: ClientConfig<Ctx>,
}

impl<Ctx> Client<Ctx> {
    fn from_token(token: ConnectToken, cfg: ClientConfig<Ctx>) -> Self {
        Self {
            id: 0,
            state: ClientState::Disconnected,
            time: 0.0,
            connect_start_time: 0.0,
            last_send_time: f64::NEG_INFINITY,
            last_receive_time: f64::NEG_INFINITY,
            server_addr_idx: 0,
            sequence: 0,
            challenge_sequence: 0,
            challenge_token_data: [0u8; ChallengeToken::SIZE],
            token,
            replay_protection: ReplayProtection::new(),
            max_clients: 0,
            should_disconnect: false,
            should_disconnect_state: ClientState::Disconnected,
            receive_queue: VecDeque::new(),
            loopback: false,
            cfg,
        }
    }

    pub fn with_config(token_bytes: &[u8], cfg: ClientConfig<Ctx>) -> Result<Self> {
        if token_bytes.len() != ConnectToken::SIZE {
            return Err(Error::SizeMismatch(ConnectToken::SIZE, token_bytes.len()));
        }
        let token = ConnectToken::try_from_bytes(token_bytes).map_err(Error::InvalidToken)?;
        Ok(Self::from_token(token, cfg))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.token.server_addresses[self.server_addr_idx]
    }

    fn set_state(&mut self, state: ClientState) {
        debug!(from = ?self.state, to = ?state, "client state change");
        if let Some(cb) = &mut self.cfg.on_state_change {
            cb(self.state, state, &mut self.cfg.context);
        }
        self.state = state;
    }

    /// Parses the token, copies its keys, and starts the handshake on the
    /// first listed server address.
    pub fn connect(&mut self) {
        self.server_addr_idx = 0;
        self.sequence = 0;
        self.reset_attempt();
        self.connect_start_time = self.time;
        self.set_state(ClientState::SendingRequest);
    }

    fn reset_attempt(&mut self) {
        self.last_send_time = self.time - 1.0;
        self.last_receive_time = self.time;
        self.should_disconnect = false;
        self.should_disconnect_state = ClientState::Disconnected;
        self.challenge_sequence = 0;
        self.replay_protection = ReplayProtection::new();
    }

    fn failover(&mut self) -> core::result::Result<(), ()> {
        if self.server_addr_idx + 1 >= self.token.server_addresses.len() {
            return Err(());
        }
        self.server_addr_idx += 1;
        self.sequence = 0;
        self.reset_attempt();
        self.set_state(ClientState::SendingRequest);
        Ok(())
    }

    fn send_packets(&mut self, transport: &mut impl Transport) -> Result<()> {
        if self.loopback || self.time - self.last_send_time < self.cfg.packet_send_rate {
            return Ok(());
        }
        let packet = match self.state {
            ClientState::SendingRequest => RequestPacket::create(
                self.token.protocol_id,
                self.token.expire_timestamp,
                self.token.nonce,
                self.token.private_data,
            ),
            ClientState::SendingResponse => {
                ResponsePacket::create(self.challenge_sequence, self.challenge_token_data)
            }
            // client -> server keep-alives carry placeholder values; the
            // server ignores both fields on receipt. `max_clients` still
            // needs to be in the codec's valid range (1..=256).
            ClientState::Connected => KeepAlivePacket::create(0, 1),
            _ => return Ok(()),
        };
        self.send_packet(packet, transport)
    }

    fn send_packet(&mut self, packet: Packet<'_>, transport: &mut impl Transport) -> Result<()> {
        let mut buf = [0u8; MAX_PKT_BUF_SIZE];
        let size = packet.write(
            &mut buf,
            self.sequence,
            &self.token.client_to_server_key,
            self.token.protocol_id,
        )?;
        transport.send_to(self.server_addr(), &buf[..size])?;
        self.last_send_time = self.time;
        self.sequence += 1;
        Ok(())
    }

    fn process_packet(&mut self, from: SocketAddr, packet: Packet<'_>) {
        if from != self.server_addr() {
            trace!(%from, "packet from unexpected address, ignoring");
            return;
        }
        match (packet, self.state) {
            (Packet::Denied(_), ClientState::SendingRequest | ClientState::SendingResponse) => {
                debug!("connection denied by server");
                self.should_disconnect = true;
                self.should_disconnect_state = ClientState::ConnectionDenied;
            }
            (Packet::Challenge(pkt), ClientState::SendingRequest) => {
                debug!("received challenge from server");
                self.challenge_sequence = pkt.sequence;
                self.challenge_token_data = pkt.token;
                self.set_state(ClientState::SendingResponse);
            }
            (Packet::KeepAlive(pkt), ClientState::SendingResponse) => {
                self.id = pkt.client_index as ClientId;
                self.max_clients = pkt.max_clients;
                self.set_state(ClientState::Connected);
            }
            (Packet::KeepAlive(_), ClientState::Connected) => {
                trace!("received keep-alive from server");
            }
            (Packet::Payload(pkt), ClientState::Connected) => {
                self.receive_queue.push_back(pkt.buf.to_vec());
            }
            (Packet::Disconnect(_), ClientState::Connected) => {
                debug!("received disconnect from server");
                self.should_disconnect = true;
                self.should_disconnect_state = ClientState::Disconnected;
            }
            _ => return,
        }
        self.last_receive_time = self.time;
    }

    fn recv_packet(&mut self, buf: &mut [u8], from: SocketAddr) -> Result<()> {
        if buf.len() <= 1 {
            return Ok(());
        }
        let result = Packet::read(
            buf,
            self.token.protocol_id,
            super::utils::now(),
            &self.token.server_to_client_key,
            Some(&mut self.replay_protection),
            ALLOWED_PACKETS,
        );
        match result {
            Ok((packet, _)) => self.process_packet(from, packet),
            Err(e) => trace!(?e, "client dropped malformed packet"),
        }
        Ok(())
    }

    fn recv_packets(&mut self, transport: &mut impl Transport) -> Result<()> {
        let mut buf = [0u8; MAX_PKT_BUF_SIZE];
        while let Some((len, from)) = transport.recv_from(&mut buf)? {
            self.recv_packet(&mut buf[..len], from)?;
        }
        Ok(())
    }

    fn update_state(&mut self) {
        let token_lifetime =
            self.token.expire_timestamp as f64 - self.token.create_timestamp as f64;
        let token_expired = self.time - self.connect_start_time >= token_lifetime;
        let timed_out = self.token.timeout_seconds > 0
            && self.last_receive_time + self.token.timeout_seconds as f64 <= self.time;

        if self.state.is_pending() && token_expired {
            debug!("connect token expired");
            self.finish(ClientState::TokenExpired);
            return;
        }
        if self.should_disconnect {
            if self.failover().is_ok() {
                return;
            }
            self.finish(self.should_disconnect_state);
            return;
        }
        if !timed_out {
            return;
        }
        match self.state {
            ClientState::SendingRequest => {
                if self.failover().is_ok() {
                    return;
                }
                self.finish(ClientState::RequestTimeout);
            }
            ClientState::SendingResponse => {
                if self.failover().is_ok() {
                    return;
                }
                self.finish(ClientState::ResponseTimeout);
            }
            ClientState::Connected => self.finish(ClientState::ConnectionTimeout),
            _ => {}
        }
    }

    fn finish(&mut self, state: ClientState) {
        self.set_state(state);
    }

    /// Advances client time, drains inbound packets, runs the send cadence,
    /// and updates state (timeouts, token expiry, failover).
    pub fn update(&mut self, time: f64, transport: &mut impl Transport) -> Result<()> {
        self.time = time;
        if self.loopback {
            return Ok(());
        }
        self.recv_packets(transport)?;
        self.send_packets(transport)?;
        self.update_state();
        Ok(())
    }

    /// Pops the oldest undelivered payload, if any.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.receive_queue.pop_front()
    }

    /// Sends an application payload. Resets the keep-alive send timer.
    /// Silently ignored unless [`ClientState::Connected`].
    pub fn send(&mut self, buf: &[u8], transport: &mut impl Transport) -> Result<()> {
        if self.state != ClientState::Connected {
            trace!("tried to send while not connected, ignoring");
            return Ok(());
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(Error::SizeMismatch(MAX_PACKET_SIZE, buf.len()));
        }
        if self.loopback {
            return Ok(());
        }
        self.send_packet(PayloadPacket::create(buf), transport)
    }

    /// Flushes redundant disconnect packets (unless already on a failure
    /// path) and clears all per-connection state.
    pub fn disconnect(&mut self, transport: &mut impl Transport) -> Result<()> {
        if !self.loopback && !self.state.is_error() {
            for _ in 0..self.cfg.num_disconnect_packets {
                let _ = self.send_packet(DisconnectPacket::create(), transport);
            }
        }
        self.sequence = 0;
        self.server_addr_idx = 0;
        self.set_state(ClientState::Disconnected);
        self.reset_attempt();
        Ok(())
    }

    /// Attaches this client to a loopback server slot: no socket traffic, no
    /// keep-alives, no timeouts (§4.5). Payload delivery goes through
    /// [`Client::recv`]/[`Client::deliver_loopback`] instead of a transport.
    pub fn connect_loopback(&mut self, client_id: ClientId, max_clients: u32) {
        self.loopback = true;
        self.id = client_id;
        self.max_clients = max_clients;
        self.set_state(ClientState::Connected);
    }

    pub fn disconnect_loopback(&mut self) {
        self.loopback = false;
        self.set_state(ClientState::Disconnected);
    }

    /// Delivers a payload sent by a loopback server directly into the
    /// receive queue, bypassing the transport.
    pub fn deliver_loopback(&mut self, payload: Vec<u8>) {
        if self.loopback {
            self.receive_queue.push_back(payload);
        }
    }
}

#[cfg(feature = "std")]
impl Client<()> {
    pub fn new(token_bytes: &[u8]) -> Result<Self> {
        Self::with_config(token_bytes, ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    struct NullTransport;
    impl Transport for NullTransport {
        fn send_to(&mut self, _addr: SocketAddr, _buf: &[u8]) -> no_std_io2::io::Result<()> {
            Ok(())
        }
        fn recv_from(&mut self, _buf: &mut [u8]) -> no_std_io2::io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn token_bytes(addrs: &[SocketAddr], timeout: i32) -> [u8; ConnectToken::SIZE] {
        let key = crypto::generate_key();
        ConnectToken::build(addrs.iter().copied(), 0x1122, 1, key)
            .timeout_seconds(timeout)
            .generate()
            .unwrap()
            .try_into_bytes()
            .unwrap()
    }

    #[test]
    fn connect_starts_sending_requests() {
        let bytes = token_bytes(&[addr(40000)], 15);
        let mut client = Client::new(&bytes).unwrap();
        client.connect();
        assert_eq!(client.state(), ClientState::SendingRequest);
        assert_eq!(client.server_addr(), addr(40000));
    }

    #[test]
    fn request_timeout_fails_over_then_terminates() {
        let bytes = token_bytes(&[addr(40000), addr(40001)], 1);
        let mut client = Client::new(&bytes).unwrap();
        client.connect();
        let mut transport = NullTransport;

        client.update(10.0, &mut transport).unwrap();
        assert_eq!(client.state(), ClientState::SendingRequest);
        assert_eq!(client.server_addr_idx, 1);

        client.update(20.0, &mut transport).unwrap();
        assert_eq!(client.state(), ClientState::RequestTimeout);
        assert!(client.state().is_error());
    }

    #[test]
    fn token_expiry_wins_over_pending_handshake() {
        let key = crypto::generate_key();
        let token = ConnectToken::build([addr(40000)], 0x1122, 1, key)
            .expire_seconds(1)
            .generate()
            .unwrap();
        let bytes = token.try_into_bytes().unwrap();
        let mut client = Client::with_config(&bytes, ClientConfig::default()).unwrap();
        client.connect();
        let mut transport = NullTransport;
        client.update(5.0, &mut transport).unwrap();
        assert_eq!(client.state(), ClientState::TokenExpired);
    }

    #[test]
    fn keep_alive_records_server_assigned_client_index() {
        let bytes = token_bytes(&[addr(40000)], 15);
        let mut client = Client::new(&bytes).unwrap();
        client.connect();
        client.set_state(ClientState::SendingResponse);

        client.process_packet(addr(40000), KeepAlivePacket::create(3, 4));

        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.id(), 3);
        assert_eq!(client.max_clients, 4);
    }

    #[test]
    fn loopback_bypasses_handshake_entirely() {
        let bytes = token_bytes(&[addr(40000)], 15);
        let mut client = Client::new(&bytes).unwrap();
        client.connect_loopback(42, 4);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.id(), 42);
        client.deliver_loopback(alloc::vec![1, 2, 3]);
        assert_eq!(client.recv(), Some(alloc::vec![1, 2, 3]));
    }
}
