//! Wire envelope for overlay packets.
//!
//! The format is internal to this crate: nothing outside the node parses
//! it, and it may change between versions behind the envelope version
//! byte. Every datagram starts with a fixed 20-byte header which is
//! authenticated (as AAD) but never encrypted, so receivers can route a
//! packet to the right session before paying for the AEAD open:
//!
//! ```text
//! [0]      version
//! [1]      verb
//! [2..7]   destination address (40 bits)
//! [7..12]  source address (40 bits)
//! [12..20] send counter (big endian)
//! [20..]   payload (sealed, except HELLO which is cleartext CBOR)
//! ```
//!
//! HELLO travels in the clear because the receiver does not yet know the
//! sender; its authenticity comes from the enclosed identity, whose
//! address must re-derive from the public key. Everything else is
//! ChaCha20-Poly1305 under a per-pair session key, with the nonce formed
//! from the send counter plus the sender's low address bits so the two
//! directions of a shared key never collide.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use nom::{bytes::complete::take, number::complete::be_u64, number::complete::u8 as nom_u8, IResult};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::net::SocketAddr;
use zeroize::Zeroizing;

use zerolink_core::{Error, Mac, NetworkId, NetworkInfo, NodeId, Result};

/// Envelope format version.
pub const WIRE_VERSION: u8 = 1;
/// Fixed header length.
pub const HEADER_LEN: usize = 20;
/// Largest datagram we will emit or accept.
pub const MAX_PACKET_LEN: usize = 10_000;

/// Packet verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Hello = 1,
    OkHello = 2,
    Frame = 3,
    ConfigRequest = 4,
    Config = 5,
    MulticastLike = 6,
}

impl Verb {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Verb::Hello),
            2 => Some(Verb::OkHello),
            3 => Some(Verb::Frame),
            4 => Some(Verb::ConfigRequest),
            5 => Some(Verb::Config),
            6 => Some(Verb::MulticastLike),
            _ => None,
        }
    }
}

/// A parsed envelope borrowing the datagram.
#[derive(Debug)]
pub struct Envelope<'a> {
    pub verb: Verb,
    pub dest: NodeId,
    pub src: NodeId,
    pub counter: u64,
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

fn parse_node_id(input: &[u8]) -> IResult<&[u8], NodeId> {
    let (input, raw) = take(5u8)(input)?;
    let mut v = 0u64;
    for b in raw {
        v = (v << 8) | *b as u64;
    }
    Ok((input, NodeId::new(v)))
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u8, u8, NodeId, NodeId, u64)> {
    let (input, version) = nom_u8(input)?;
    let (input, verb) = nom_u8(input)?;
    let (input, dest) = parse_node_id(input)?;
    let (input, src) = parse_node_id(input)?;
    let (input, counter) = be_u64(input)?;
    Ok((input, (version, verb, dest, src, counter)))
}

/// Parse and structurally validate a datagram.
pub fn parse_envelope(datagram: &[u8]) -> Result<Envelope<'_>> {
    if datagram.len() < HEADER_LEN || datagram.len() > MAX_PACKET_LEN {
        return Err(Error::protocol("bad datagram length"));
    }
    let (payload, (version, verb, dest, src, counter)) =
        parse_header(datagram).map_err(|_| Error::protocol("truncated header"))?;
    if version != WIRE_VERSION {
        return Err(Error::protocol("unknown wire version"));
    }
    let verb = Verb::from_u8(verb).ok_or_else(|| Error::protocol("unknown verb"))?;
    Ok(Envelope {
        verb,
        dest,
        src,
        counter,
        header: &datagram[..HEADER_LEN],
        payload,
    })
}

fn encode_header(out: &mut Vec<u8>, verb: Verb, dest: NodeId, src: NodeId, counter: u64) {
    out.push(WIRE_VERSION);
    out.push(verb as u8);
    out.extend_from_slice(&dest.0.to_be_bytes()[3..8]);
    out.extend_from_slice(&src.0.to_be_bytes()[3..8]);
    out.extend_from_slice(&counter.to_be_bytes());
}

/// Encode a cleartext packet (HELLO only).
pub fn encode_clear(verb: Verb, dest: NodeId, src: NodeId, counter: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_header(&mut out, verb, dest, src, counter);
    out.extend_from_slice(payload);
    out
}

/// A per-peer symmetric session key.
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    /// Derive the pair key from an x25519 agreement. Address order is
    /// normalized so both ends derive the same key.
    pub fn derive(shared: &[u8; 32], a: NodeId, b: NodeId) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut info = [0u8; 10];
        info[..5].copy_from_slice(&lo.0.to_be_bytes()[3..8]);
        info[5..].copy_from_slice(&hi.0.to_be_bytes()[3..8]);
        let hk = Hkdf::<Sha512>::new(Some(b"zerolink/v1/session"), shared);
        let mut okm = Zeroizing::new([0u8; 32]);
        // 32 bytes from SHA-512 HKDF cannot fail
        let _ = hk.expand(&info, okm.as_mut());
        SessionKey(okm)
    }

    fn nonce(counter: u64, sender: NodeId) -> Nonce {
        let mut n = [0u8; 12];
        n[..8].copy_from_slice(&counter.to_be_bytes());
        n[8..].copy_from_slice(&(sender.0 as u32).to_be_bytes());
        Nonce::from(n)
    }

    /// Build a complete sealed packet.
    pub fn seal(
        &self,
        verb: Verb,
        dest: NodeId,
        src: NodeId,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + 16);
        encode_header(&mut out, verb, dest, src, counter);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.0.as_ref()));
        let sealed = cipher
            .encrypt(
                &Self::nonce(counter, src),
                Payload { msg: plaintext, aad: &out[..HEADER_LEN] },
            )
            .map_err(|_| Error::protocol("seal failed"))?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed envelope, authenticating its header.
    pub fn open(&self, env: &Envelope<'_>) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.0.as_ref()));
        cipher
            .decrypt(
                &Self::nonce(env.counter, env.src),
                Payload { msg: env.payload, aad: env.header },
            )
            .map_err(|_| Error::protocol("authentication failed"))
    }
}

/// HELLO payload: the sender's identity plus a timestamp echoed back in
/// OK(HELLO) for latency measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub identity: String,
    pub timestamp_ms: i64,
    pub version: (u16, u16, u16),
}

/// OK(HELLO) payload. Travels in the clear for the same reason HELLO does:
/// the HELLO initiator knows the responder's address but not yet its key,
/// so this reply completes the identity exchange in the other direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkHello {
    pub identity: String,
    pub echo_timestamp_ms: i64,
    pub version: (u16, u16, u16),
    /// The address this packet's sender observed the HELLO arriving from;
    /// lets a node learn its external mapping.
    pub observed_addr: Option<SocketAddr>,
}

/// Network config request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub nwid: NetworkId,
    pub timestamp_ms: i64,
}

/// Controller reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigReply {
    Ok(NetworkInfo),
    NotFound,
    AccessDenied,
    ClientTooOld,
}

/// Config message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub nwid: NetworkId,
    pub reply: ConfigReply,
}

/// Multicast subscription gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastLike {
    pub nwid: NetworkId,
    pub subscribed: Vec<(Mac, u32)>,
    pub unsubscribed: Vec<(Mac, u32)>,
}

/// Serialize a CBOR payload.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| Error::protocol(e.to_string()))?;
    Ok(out)
}

/// Deserialize a CBOR payload.
pub fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| Error::protocol(e.to_string()))
}

/// An Ethernet frame relayed over the overlay. Encoded by hand: this is
/// the hot path and the layout is trivial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload<'a> {
    pub nwid: NetworkId,
    pub src_mac: Mac,
    pub dst_mac: Mac,
    pub ethertype: u16,
    pub vlan: u16,
    pub data: &'a [u8],
}

const FRAME_FIXED_LEN: usize = 8 + 6 + 6 + 2 + 2;

impl<'a> FramePayload<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_FIXED_LEN + self.data.len());
        out.extend_from_slice(&self.nwid.0.to_be_bytes());
        out.extend_from_slice(&self.src_mac.0);
        out.extend_from_slice(&self.dst_mac.0);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.vlan.to_be_bytes());
        out.extend_from_slice(self.data);
        out
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < FRAME_FIXED_LEN {
            return Err(Error::protocol("short frame payload"));
        }
        let nwid = NetworkId(u64::from_be_bytes(
            bytes[..8].try_into().map_err(|_| Error::protocol("frame nwid"))?,
        ));
        let mut src = [0u8; 6];
        src.copy_from_slice(&bytes[8..14]);
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&bytes[14..20]);
        let ethertype = u16::from_be_bytes([bytes[20], bytes[21]]);
        let vlan = u16::from_be_bytes([bytes[22], bytes[23]]);
        Ok(Self {
            nwid,
            src_mac: Mac(src),
            dst_mac: Mac(dst),
            ethertype,
            vlan,
            data: &bytes[FRAME_FIXED_LEN..],
        })
    }
}
