//! Server-side state machine: the slot table, the encryption-mapping table,
//! the connect-token replay cache, and the receive/send/timeout passes that
//! drive them.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::net::SocketAddr;

use tracing::{debug, trace, warn};

use super::bytes::Bytes;
use super::crypto::Key;
use super::error::{Error, Result};
use super::packet::{
    ChallengePacket, DeniedPacket, DisconnectPacket, KeepAlivePacket, Packet, PayloadPacket,
    RequestPacket,
};
use super::replay::ReplayProtection;
use super::token::{ChallengeToken, ConnectTokenPrivate};
use super::transport::Transport;
use super::{
    ClientId, MAC_BYTES, MAX_CLIENTS, MAX_PKT_BUF_SIZE, NUM_DISCONNECT_PACKETS,
    PACKET_SEND_RATE_SEC, RECEIVE_QUEUE_SIZE, USER_DATA_BYTES,
};

/// Server-local classification of why a connection request was turned away.
/// Never touches the wire — the client only ever sees an empty Denied
/// packet, per the codec's plaintext contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedReason {
    ServerFull,
    InvalidToken,
    AddressAlreadyConnected,
    ClientIdAlreadyConnected,
    TokenAlreadyUsed,
}

#[derive(Debug, Clone, Copy)]
struct EncryptionMapping {
    address: Option<SocketAddr>,
    send_key: Key,
    receive_key: Key,
    /// Absolute expiry time; negative disables.
    expire_time: f64,
    last_access_time: f64,
    timeout_seconds: i32,
    slot_index: Option<usize>,
}

impl EncryptionMapping {
    const EMPTY: Self = Self {
        address: None,
        send_key: [0; 32],
        receive_key: [0; 32],
        expire_time: -1.0,
        last_access_time: f64::NEG_INFINITY,
        timeout_seconds: 0,
        slot_index: None,
    };

    fn is_expired(&self, now: f64) -> bool {
        (self.timeout_seconds > 0 && self.last_access_time + self.timeout_seconds as f64 < now)
            || (self.expire_time >= 0.0 && self.expire_time < now)
    }
}

#[derive(Clone, Copy)]
struct TokenEntry {
    time: f64,
    tag: [u8; MAC_BYTES],
    address: SocketAddr,
}

impl TokenEntry {
    const EMPTY: Self = Self {
        time: f64::NEG_INFINITY,
        tag: [0; MAC_BYTES],
        address: SocketAddr::V4(core::net::SocketAddrV4::new(core::net::Ipv4Addr::UNSPECIFIED, 0)),
    };
}

/// Fixed-size replay cache for connect tokens, keyed by the AEAD tag of
/// their private section (see §4.6).
struct TokenEntries {
    entries: Box<[TokenEntry]>,
}

impl TokenEntries {
    fn new(capacity: usize) -> Self {
        Self {
            entries: alloc::vec![TokenEntry::EMPTY; capacity].into_boxed_slice(),
        }
    }

    /// Returns `true` if the token should be accepted: either this tag has
    /// never been seen (it's inserted, evicting the oldest entry), or it was
    /// seen before from the same source address.
    fn find_or_insert(&mut self, tag: [u8; MAC_BYTES], address: SocketAddr, now: f64) -> bool {
        let mut oldest = 0;
        let mut oldest_time = f64::INFINITY;
        let mut matching = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.time < oldest_time {
                oldest_time = entry.time;
                oldest = idx;
            }
            if entry.tag == tag {
                matching = Some(idx);
            }
        }
        if let Some(idx) = matching {
            return self.entries[idx].address == address;
        }
        self.entries[oldest] = TokenEntry { time: now, tag, address };
        true
    }
}

/// One of up to [`MAX_CLIENTS`] fixed client seats. Lifecycle: free →
/// pending (mapping established, not yet bound) → connected → disconnected
/// → free.
struct Slot {
    connected: bool,
    confirmed: bool,
    loopback: bool,
    client_id: ClientId,
    address: Option<SocketAddr>,
    mapping_index: Option<usize>,
    send_key: Key,
    receive_key: Key,
    sequence: u64,
    last_send_time: f64,
    last_receive_time: f64,
    timeout_seconds: i32,
    replay_protection: ReplayProtection,
    receive_queue: VecDeque<(u64, Vec<u8>)>,
    user_data: [u8; USER_DATA_BYTES],
}

impl Slot {
    fn free() -> Self {
        Self {
            connected: false,
            confirmed: false,
            loopback: false,
            client_id: 0,
            address: None,
            mapping_index: None,
            send_key: [0; 32],
            receive_key: [0; 32],
            sequence: 0,
            last_send_time: f64::NEG_INFINITY,
            last_receive_time: f64::NEG_INFINITY,
            timeout_seconds: 0,
            replay_protection: ReplayProtection::new(),
            receive_queue: VecDeque::with_capacity(RECEIVE_QUEUE_SIZE),
            user_data: [0; USER_DATA_BYTES],
        }
    }

    fn reset(&mut self) {
        *self = Self::free();
    }
}

/// `on_connect`/`on_disconnect` callbacks, invoked synchronously from the
/// endpoint's own `tick`.
pub type Callback<Ctx> = Box<dyn FnMut(ClientId, &mut Ctx) + Send + Sync + 'static>;

pub struct ServerConfig<Ctx> {
    num_disconnect_packets: usize,
    keep_alive_send_rate: f64,
    max_clients: usize,
    context: Ctx,
    on_connect: Option<Callback<Ctx>>,
    on_disconnect: Option<Callback<Ctx>>,
}

impl Default for ServerConfig<()> {
    fn default() -> Self {
        Self::with_context(())
    }
}

impl<Ctx> ServerConfig<Ctx> {
    pub fn with_context(context: Ctx) -> Self {
        Self {
            num_disconnect_packets: NUM_DISCONNECT_PACKETS,
            keep_alive_send_rate: PACKET_SEND_RATE_SEC,
            max_clients: MAX_CLIENTS,
            context,
            on_connect: None,
            on_disconnect: None,
        }
    }

    pub fn num_disconnect_packets(mut self, n: usize) -> Self {
        self.num_disconnect_packets = n;
        self
    }

    pub fn keep_alive_send_rate(mut self, seconds: f64) -> Self {
        self.keep_alive_send_rate = seconds;
        self
    }

    /// Number of client slots; must be in `1..=256`.
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: FnMut(ClientId, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_connect = Some(alloc::boxed::Box::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: FnMut(ClientId, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(alloc::boxed::Box::new(f));
        self
    }
}

/// Set of packet types the server accepts on its receive path: request,
/// response, keep-alive, payload, disconnect (denied and challenge are
/// server-to-client only).
const ALLOWED_PACKETS: u8 = (1 << Packet::REQUEST)
    | (1 << Packet::RESPONSE)
    | (1 << Packet::KEEP_ALIVE)
    | (1 << Packet::PAYLOAD)
    | (1 << Packet::DISCONNECT);

/// A netcode server: owns the slot table, the encryption-mapping table, and
/// the connect-token replay cache for one protocol-id/private-key pair.
pub struct Server<Ctx = ()> {
    address: SocketAddr,
    protocol_id: u64,
    private_key: Key,
    challenge_key: Key,
    challenge_sequence: u64,
    /// Outbound sequence counter shared by denied/challenge packets, not yet
    /// tied to a slot. Starts at `1 << 63` so it can never collide with a
    /// per-slot counter (which starts at 0).
    global_sequence: u64,
    time: f64,
    slots: Vec<Slot>,
    mappings: Vec<EncryptionMapping>,
    token_entries: TokenEntries,
    cfg: ServerConfig<Ctx>,
}

impl<Ctx> Server<Ctx> {
    pub fn with_config(
        protocol_id: u64,
        private_key: Key,
        address: SocketAddr,
        cfg: ServerConfig<Ctx>,
    ) -> Result<Self> {
        let max_clients = cfg.max_clients;
        if max_clients == 0 || max_clients > MAX_CLIENTS {
            return Err(Error::InvalidMaxClients(max_clients));
        }
        Ok(Self {
            address,
            protocol_id,
            private_key,
            challenge_key: super::crypto::generate_key(),
            challenge_sequence: 0,
            global_sequence: 1 << 63,
            time: 0.0,
            slots: (0..max_clients).map(|_| Slot::free()).collect(),
            mappings: alloc::vec![EncryptionMapping::EMPTY; max_clients * 4],
            token_entries: TokenEntries::new(max_clients * 8),
            cfg,
        })
    }

    pub fn num_connected(&self) -> usize {
        self.slots.iter().filter(|s| s.connected).count()
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.slots.iter().filter(|s| s.connected).map(|s| s.client_id)
    }

    fn find_slot_by_address(&self, addr: &SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.connected && s.address.as_ref() == Some(addr))
    }

    fn find_slot_by_client_id(&self, client_id: ClientId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.connected && s.client_id == client_id)
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.connected)
    }

    fn find_mapping_by_address(&self, addr: &SocketAddr) -> Option<usize> {
        self.mappings
            .iter()
            .position(|m| m.address.as_ref() == Some(addr) && !m.is_expired(self.time))
    }

    fn insert_mapping(
        &mut self,
        address: SocketAddr,
        send_key: Key,
        receive_key: Key,
        expire_time: f64,
        timeout_seconds: i32,
    ) -> usize {
        if let Some(idx) = self.find_mapping_by_address(&address) {
            self.mappings[idx] = EncryptionMapping {
                address: Some(address),
                send_key,
                receive_key,
                expire_time,
                last_access_time: self.time,
                timeout_seconds,
                slot_index: None,
            };
            return idx;
        }
        // Prefer a slot that has never been used, then one that's genuinely
        // expired; both are free to take. Never touch a mapping still bound
        // to a slot (`slot_index.is_some()`) — that would clobber a
        // connected client. The last resort (oldest unbound-but-unexpired
        // entry, e.g. still mid-handshake) only triggers if the table's
        // unbound slack is entirely mid-handshake pending mappings.
        let idx = self
            .mappings
            .iter()
            .position(|m| m.slot_index.is_none() && m.last_access_time == f64::NEG_INFINITY)
            .or_else(|| {
                self.mappings
                    .iter()
                    .position(|m| m.slot_index.is_none() && m.is_expired(self.time))
            })
            .or_else(|| {
                self.mappings
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.slot_index.is_none())
                    .min_by(|(_, a), (_, b)| a.last_access_time.total_cmp(&b.last_access_time))
                    .map(|(i, _)| i)
            })
            .expect("mapping table capacity exceeds max_clients, so an unbound slot always exists");
        self.mappings[idx] = EncryptionMapping {
            address: Some(address),
            send_key,
            receive_key,
            expire_time,
            last_access_time: self.time,
            timeout_seconds,
            slot_index: None,
        };
        idx
    }

    /// Advances server time and runs the send/timeout pass: pumps keep-alive
    /// packets on connected non-loopback slots whose last send is stale, and
    /// silently disconnects any slot past its per-slot timeout.
    pub fn update(&mut self, time: f64, transport: &mut impl Transport) -> Result<()> {
        self.time = time;
        for idx in 0..self.slots.len() {
            if !self.slots[idx].connected || self.slots[idx].loopback {
                continue;
            }
            let timeout = self.slots[idx].timeout_seconds;
            if timeout > 0 && self.slots[idx].last_receive_time + timeout as f64 <= self.time {
                debug!(client_id = self.slots[idx].client_id, "client timed out");
                self.free_slot(idx);
                continue;
            }
            if self.time - self.slots[idx].last_send_time >= self.cfg.keep_alive_send_rate {
                self.send_keep_alive(idx, transport)?;
            }
        }
        Ok(())
    }

    fn send_keep_alive(&mut self, idx: usize, transport: &mut impl Transport) -> Result<()> {
        let max_clients = self.slots.len() as u32;
        let packet = KeepAlivePacket::create(idx as u32, max_clients);
        self.send_to_slot(idx, packet, transport)
    }

    fn send_to_slot(
        &mut self,
        idx: usize,
        packet: Packet<'_>,
        transport: &mut impl Transport,
    ) -> Result<()> {
        let Some(address) = self.slots[idx].address else {
            return Ok(());
        };
        let mut buf = [0u8; MAX_PKT_BUF_SIZE];
        let sequence = self.slots[idx].sequence;
        let size = packet.write(&mut buf, sequence, &self.slots[idx].send_key, self.protocol_id)?;
        self.slots[idx].sequence += 1;
        self.slots[idx].last_send_time = self.time;
        transport.send_to(address, &buf[..size]).map_err(Error::from)
    }

    /// The receive path: look up the keys for `from`, decode, and dispatch.
    pub fn recv_packet(
        &mut self,
        buf: &mut [u8],
        from: SocketAddr,
        transport: &mut impl Transport,
    ) -> Result<()> {
        if let Some(slot_idx) = self.find_slot_by_address(&from) {
            let key = self.slots[slot_idx].receive_key;
            let (packet, _sequence) = {
                let slot = &mut self.slots[slot_idx];
                match Packet::read(
                    buf,
                    self.protocol_id,
                    super::utils::now(),
                    &key,
                    Some(&mut slot.replay_protection),
                    ALLOWED_PACKETS,
                ) {
                    Ok(v) => v,
                    Err(e) => {
                        trace!(?e, "dropping malformed packet from connected client");
                        return Ok(());
                    }
                }
            };
            return self.dispatch_connected(slot_idx, packet);
        }

        if let Some(mapping_idx) = self.find_mapping_by_address(&from) {
            let key = self.mappings[mapping_idx].receive_key;
            let result = Packet::read(
                buf,
                self.protocol_id,
                super::utils::now(),
                &key,
                None,
                ALLOWED_PACKETS,
            );
            return match result {
                Ok((packet, _)) => self.dispatch_pending(mapping_idx, from, packet, transport),
                Err(e) => {
                    trace!(?e, "dropping malformed packet from pending client");
                    Ok(())
                }
            };
        }

        if buf.first() != Some(&Packet::REQUEST) {
            trace!(%from, "no key available for non-request packet, dropping");
            return Ok(());
        }
        let result = Packet::read(
            buf,
            self.protocol_id,
            super::utils::now(),
            &self.private_key,
            None,
            1 << Packet::REQUEST,
        );
        match result {
            Ok((Packet::Request(request), _)) => self.handle_request(request, from, transport),
            Ok(_) => unreachable!("only request packets decode without a key"),
            Err(e) => {
                trace!(?e, "dropping malformed connection request");
                Ok(())
            }
        }
    }

    fn handle_request(
        &mut self,
        request: RequestPacket,
        from: SocketAddr,
        transport: &mut impl Transport,
    ) -> Result<()> {
        let private = match request.decrypt_token_data(&self.private_key) {
            Ok(p) => p,
            Err(e) => {
                trace!(?e, "could not decrypt connect token private section");
                return Ok(());
            }
        };

        if !private.server_addresses.contains(&self.address) {
            trace!("connect token does not list this server's address, dropping");
            return Ok(());
        }
        if self.find_slot_by_address(&from).is_some() {
            trace!(%from, "address already has a slot, dropping duplicate request");
            return Ok(());
        }
        if self.find_slot_by_client_id(private.client_id).is_some() {
            trace!(client_id = private.client_id, "client id already connected, dropping");
            return Ok(());
        }

        let mut tag = [0u8; MAC_BYTES];
        tag.copy_from_slice(&request.token_data[ConnectTokenPrivate::SIZE - MAC_BYTES..]);
        if !self.token_entries.find_or_insert(tag, from, self.time) {
            debug!(%from, "rejecting replayed connect token from a new address");
            return self.send_denied(from, private.server_to_client_key, transport);
        }

        if self.find_free_slot().is_none() {
            debug!(%from, "server full, denying connection request");
            return self.send_denied(from, private.server_to_client_key, transport);
        }

        let expire_time = if private.timeout_seconds < 0 {
            -1.0
        } else {
            self.time + private.timeout_seconds as f64
        };
        self.insert_mapping(
            from,
            private.server_to_client_key,
            private.client_to_server_key,
            expire_time,
            private.timeout_seconds,
        );

        let challenge = ChallengeToken {
            client_id: private.client_id,
            user_data: private.user_data,
        };
        let sequence = self.challenge_sequence;
        self.challenge_sequence += 1;
        let encrypted = challenge
            .encrypt(sequence, &self.challenge_key)
            .map_err(super::packet::Error::from)?;
        let packet = ChallengePacket::create(sequence, encrypted);
        self.send_global(from, private.server_to_client_key, packet, transport)
    }

    fn dispatch_pending(
        &mut self,
        mapping_idx: usize,
        from: SocketAddr,
        packet: Packet<'_>,
        transport: &mut impl Transport,
    ) -> Result<()> {
        let Packet::Response(response) = packet else {
            trace!("ignoring non-response packet from a pending client");
            return Ok(());
        };
        let challenge = match ChallengeToken::decrypt(
            response.token,
            response.sequence,
            &self.challenge_key,
        ) {
            Ok(c) => c,
            Err(e) => {
                trace!(?e, "challenge token failed to decrypt, dropping response");
                return Ok(());
            }
        };

        if self.find_slot_by_address(&from).is_some()
            || self.find_slot_by_client_id(challenge.client_id).is_some()
        {
            trace!("duplicate slot for challenge response, dropping");
            return Ok(());
        }
        let Some(slot_idx) = self.find_free_slot() else {
            debug!("server full, denying challenge response");
            let send_key = self.mappings[mapping_idx].send_key;
            return self.send_denied(from, send_key, transport);
        };

        let mapping = self.mappings[mapping_idx];
        self.mappings[mapping_idx].slot_index = Some(slot_idx);
        let slot = &mut self.slots[slot_idx];
        slot.reset();
        slot.connected = true;
        slot.confirmed = false;
        slot.client_id = challenge.client_id;
        slot.address = Some(from);
        slot.mapping_index = Some(mapping_idx);
        slot.send_key = mapping.send_key;
        slot.receive_key = mapping.receive_key;
        slot.timeout_seconds = mapping.timeout_seconds;
        slot.user_data = challenge.user_data;
        slot.last_receive_time = self.time;

        if let Some(cb) = &mut self.cfg.on_connect {
            cb(challenge.client_id, &mut self.cfg.context);
        }
        self.send_keep_alive(slot_idx, transport)
    }

    /// Dispatches a packet already decoded on a connected slot's keys. Never
    /// sends a reply itself — keep-alives and disconnect flushes happen on
    /// the send path instead.
    fn dispatch_connected(&mut self, slot_idx: usize, packet: Packet<'_>) -> Result<()> {
        match packet {
            Packet::KeepAlive(_) => {
                let slot = &mut self.slots[slot_idx];
                slot.confirmed = true;
                slot.last_receive_time = self.time;
            }
            Packet::Payload(PayloadPacket { buf }) => {
                let slot = &mut self.slots[slot_idx];
                slot.confirmed = true;
                slot.last_receive_time = self.time;
                if slot.receive_queue.len() >= RECEIVE_QUEUE_SIZE {
                    warn!(client_id = slot.client_id, "receive queue full, dropping newest payload");
                } else {
                    slot.receive_queue.push_back((self.time as u64, buf.to_vec()));
                }
            }
            Packet::Disconnect(_) => {
                debug!(client_id = self.slots[slot_idx].client_id, "client disconnected");
                self.free_slot(slot_idx);
            }
            Packet::Request(_) => {
                trace!("ignoring connection request from an already-connected address");
            }
            _ => {}
        }
        Ok(())
    }

    fn send_denied(
        &mut self,
        to: SocketAddr,
        send_key: Key,
        transport: &mut impl Transport,
    ) -> Result<()> {
        self.send_global(to, send_key, DeniedPacket::create(), transport)
    }

    fn send_global(
        &mut self,
        to: SocketAddr,
        send_key: Key,
        packet: Packet<'_>,
        transport: &mut impl Transport,
    ) -> Result<()> {
        let mut buf = [0u8; MAX_PKT_BUF_SIZE];
        let sequence = self.global_sequence;
        let size = packet.write(&mut buf, sequence, &send_key, self.protocol_id)?;
        self.global_sequence += 1;
        transport.send_to(to, &buf[..size]).map_err(Error::from)
    }

    fn free_slot(&mut self, idx: usize) {
        if let Some(mapping_idx) = self.slots[idx].mapping_index {
            self.mappings[mapping_idx] = EncryptionMapping::EMPTY;
        }
        let client_id = self.slots[idx].client_id;
        self.slots[idx].reset();
        if let Some(cb) = &mut self.cfg.on_disconnect {
            cb(client_id, &mut self.cfg.context);
        }
    }

    /// Pops the oldest undelivered payload for `client_id`, if any.
    pub fn recv(&mut self, client_id: ClientId) -> Option<alloc::vec::Vec<u8>> {
        let idx = self.find_slot_by_client_id(client_id)?;
        self.slots[idx].receive_queue.pop_front().map(|(_, buf)| buf)
    }

    /// Sends an application payload to `client_id`. If the slot hasn't yet
    /// confirmed the connection, a keep-alive precedes it so the client
    /// learns its slot index before the first payload.
    pub fn send(
        &mut self,
        client_id: ClientId,
        payload: &[u8],
        transport: &mut impl Transport,
    ) -> Result<()> {
        let Some(idx) = self.find_slot_by_client_id(client_id) else {
            return Err(Error::ClientNotFound(client_id));
        };
        if self.slots[idx].loopback {
            return Ok(());
        }
        if !self.slots[idx].confirmed {
            self.send_keep_alive(idx, transport)?;
        }
        self.send_to_slot(idx, PayloadPacket::create(payload), transport)
    }

    /// Programmatic disconnect: flushes redundant disconnect packets, then
    /// frees the slot.
    pub fn disconnect(&mut self, client_id: ClientId, transport: &mut impl Transport) -> Result<()> {
        let Some(idx) = self.find_slot_by_client_id(client_id) else {
            return Ok(());
        };
        if !self.slots[idx].loopback {
            for _ in 0..self.cfg.num_disconnect_packets {
                let _ = self.send_to_slot(idx, DisconnectPacket::create(), transport);
            }
        }
        self.free_slot(idx);
        Ok(())
    }

    /// Stops the server: disconnects every connected slot.
    pub fn disconnect_all(&mut self, transport: &mut impl Transport) -> Result<()> {
        let ids: Vec<ClientId> = self.client_ids().collect();
        for id in ids {
            self.disconnect(id, transport)?;
        }
        Ok(())
    }

    /// Attaches a client directly to a free slot with no socket traffic, no
    /// keep-alives, and no timeouts (§4.5).
    pub fn connect_loopback_client(
        &mut self,
        client_id: ClientId,
        user_data: [u8; USER_DATA_BYTES],
    ) -> Result<()> {
        if self.find_slot_by_client_id(client_id).is_some() {
            return Err(Error::ClientIdInUse(client_id));
        }
        let Some(idx) = self.find_free_slot() else {
            return Err(Error::ServerIsFull(client_id));
        };
        let slot = &mut self.slots[idx];
        slot.reset();
        slot.connected = true;
        slot.confirmed = true;
        slot.loopback = true;
        slot.client_id = client_id;
        slot.user_data = user_data;
        slot.last_receive_time = self.time;
        if let Some(cb) = &mut self.cfg.on_connect {
            cb(client_id, &mut self.cfg.context);
        }
        Ok(())
    }

    pub fn disconnect_loopback_client(&mut self, client_id: ClientId) {
        if let Some(idx) = self.find_slot_by_client_id(client_id) {
            self.free_slot(idx);
        }
    }

    /// Delivers a payload to a loopback client's receive queue, bypassing
    /// any socket (`receive_loopback`, §4.5).
    pub fn receive_loopback(&mut self, client_id: ClientId, payload: Vec<u8>) {
        if let Some(idx) = self.find_slot_by_client_id(client_id) {
            if self.slots[idx].loopback {
                self.slots[idx].receive_queue.push_back((self.time as u64, payload));
            }
        }
    }
}

#[cfg(feature = "std")]
impl Server<()> {
    pub fn new(protocol_id: u64, private_key: Key, address: SocketAddr) -> Result<Self> {
        Self::with_config(protocol_id, private_key, address, ServerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ConnectToken;
    use std::collections::VecDeque as StdVecDeque;

    struct LoopbackTransport {
        outbound: StdVecDeque<(SocketAddr, Vec<u8>)>,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self { outbound: StdVecDeque::new() }
        }
    }

    impl Transport for LoopbackTransport {
        fn send_to(&mut self, addr: SocketAddr, buf: &[u8]) -> no_std_io2::io::Result<()> {
            self.outbound.push_back((addr, buf.to_vec()));
            Ok(())
        }
        fn recv_from(&mut self, _buf: &mut [u8]) -> no_std_io2::io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn connection_request_gets_a_challenge_back() {
        let private_key = crate::crypto::generate_key();
        let server_addr = addr(40000);
        let mut server =
            Server::with_config(0x1122, private_key, server_addr, ServerConfig::default().max_clients(4))
                .unwrap();

        let token = ConnectToken::build([server_addr], 0x1122, 7, private_key)
            .timeout_seconds(15)
            .generate()
            .unwrap();
        let mut transport = LoopbackTransport::new();
        let request = RequestPacket::create(
            token.protocol_id,
            token.expire_timestamp,
            token.nonce,
            token.private_data,
        );
        let mut buf = [0u8; MAX_PKT_BUF_SIZE];
        let size = request.write(&mut buf, 0, &private_key, 0x1122).unwrap();

        server
            .recv_packet(&mut buf[..size], addr(50000), &mut transport)
            .unwrap();
        assert_eq!(transport.outbound.len(), 1);
        assert_eq!(server.num_connected(), 0);
    }

    #[test]
    fn server_full_denies_new_client_ids() {
        let private_key = crate::crypto::generate_key();
        let server_addr = addr(40001);
        let mut server =
            Server::with_config(0x1, private_key, server_addr, ServerConfig::default().max_clients(1))
                .unwrap();
        server.connect_loopback_client(1, [0u8; USER_DATA_BYTES]).unwrap();
        assert_eq!(server.num_connected(), 1);
        assert!(server.connect_loopback_client(2, [0u8; USER_DATA_BYTES]).is_err());
    }

    #[test]
    fn loopback_disconnect_frees_the_slot() {
        let private_key = crate::crypto::generate_key();
        let mut server =
            Server::with_config(0x1, private_key, addr(40002), ServerConfig::default().max_clients(1))
                .unwrap();
        server.connect_loopback_client(9, [0u8; USER_DATA_BYTES]).unwrap();
        server.disconnect_loopback_client(9);
        assert_eq!(server.num_connected(), 0);
    }

    #[test]
    fn token_entries_reject_replay_from_new_address() {
        let mut entries = TokenEntries::new(4);
        let tag = [1u8; MAC_BYTES];
        assert!(entries.find_or_insert(tag, addr(1), 0.0));
        assert!(entries.find_or_insert(tag, addr(1), 1.0));
        assert!(!entries.find_or_insert(tag, addr(2), 2.0));
    }

    #[test]
    fn second_connect_request_does_not_clobber_first_clients_mapping() {
        let private_key = crate::crypto::generate_key();
        let server_addr = addr(40003);
        let mut server =
            Server::with_config(0x3, private_key, server_addr, ServerConfig::default().max_clients(4))
                .unwrap();
        let mut transport = LoopbackTransport::new();

        let send_request = |server: &mut Server, client_id, from, transport: &mut LoopbackTransport| {
            let token = ConnectToken::build([server_addr], 0x3, client_id, private_key)
                .timeout_seconds(15)
                .generate()
                .unwrap();
            let request = RequestPacket::create(
                token.protocol_id,
                token.expire_timestamp,
                token.nonce,
                token.private_data,
            );
            let mut buf = [0u8; MAX_PKT_BUF_SIZE];
            let size = request.write(&mut buf, 0, &private_key, 0x3).unwrap();
            server.recv_packet(&mut buf[..size], from, transport).unwrap();
        };

        send_request(&mut server, 1, addr(50001), &mut transport);
        let first_idx = server.find_mapping_by_address(&addr(50001)).unwrap();

        send_request(&mut server, 2, addr(50002), &mut transport);
        let second_idx = server.find_mapping_by_address(&addr(50002)).unwrap();

        assert_ne!(first_idx, second_idx);
        assert_eq!(server.mappings[first_idx].address, Some(addr(50001)));
        assert_eq!(server.mappings[second_idx].address, Some(addr(50002)));
    }
}
