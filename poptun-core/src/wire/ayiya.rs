//! AYIYA ("Anything In Anything") framing.
//!
//! Wire format (lengths fixed by the header nibbles this engine accepts):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | idlen | idtype| siglen|hshmeth|autmeth| opcode|  next header  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     epoch time (seconds)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  identity (local IPv6, 16 bytes)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SHA-1 signature (20 bytes)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  payload...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Signing replaces the signature slot with the SHA-1 of the password,
//! hashes the whole frame, and writes the result back into the slot.
//! Verification is the reverse: save the received slot, restore the password
//! digest, recompute and compare.

use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Default UDP port of an AYIYA POP.
pub const AYIYA_PORT: u16 = 5072;

/// Fixed header: nibble fields, next header, epoch time.
pub const HEADER_LEN: usize = 8;
/// The identity is always a full IPv6 address here (idlen nibble 4).
pub const IDENTITY_LEN: usize = 16;
/// SHA-1 output (siglen nibble 5, i.e. five 32-bit words).
pub const SIGNATURE_LEN: usize = 20;
/// Total framing ahead of the payload.
pub const FRAMING_LEN: usize = HEADER_LEN + IDENTITY_LEN + SIGNATURE_LEN;

/// How far a peer's clock may be from ours before its frames are discarded.
/// The protocol does not pin this down; 120 seconds comfortably exceeds NTP
/// drift while still bounding replay.
pub const EPOCH_TOLERANCE: u64 = 120;

/// Payload carries IPv6.
pub const NEXT_HEADER_IPV6: u8 = 41;
/// No payload (keep-alives).
pub const NEXT_HEADER_NONE: u8 = 59;

const IDLEN_IPV6: u8 = 4; // 2^4 = 16 identity bytes
const IDTYPE_INTEGER: u8 = 1;
const SIGLEN_SHA1: u8 = 5; // 5 * 4 = 20 signature bytes
const HASH_SHA1: u8 = 2;
const AUTH_SHARED_SECRET: u8 = 1;

const SIGNATURE_OFFSET: usize = HEADER_LEN + IDENTITY_LEN;

/// AYIYA operation codes this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Keep-alive, no payload.
    Noop = 0,
    /// Deliver the payload.
    Forward = 1,
    /// Echo request.
    EchoRequest = 2,
    /// Echo request, then deliver.
    EchoRequestForward = 3,
}

impl Opcode {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Opcode::Noop),
            1 => Some(Opcode::Forward),
            2 => Some(Opcode::EchoRequest),
            3 => Some(Opcode::EchoRequestForward),
            _ => None,
        }
    }
}

/// The SHA-1 digest of the shared secret, computed once per tunnel.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHash([u8; SIGNATURE_LEN]);

impl SecretHash {
    /// Hash a password's UTF-8 bytes.
    pub fn from_password(password: &str) -> Self {
        Self(Sha1::digest(password.as_bytes()).into())
    }

    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHash(<redacted>)")
    }
}

/// Why an incoming datagram was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AyiyaError {
    /// Shorter than the fixed framing.
    #[error("frame of {0} bytes is shorter than the AYIYA framing")]
    Truncated(usize),
    /// One of the fixed header fields deviates from what we speak.
    #[error("unsupported header field {field}: {value}")]
    BadHeader {
        /// Name of the offending field.
        field: &'static str,
        /// The value found on the wire.
        value: u8,
    },
    /// Identity does not match the expected tunnel peer.
    #[error("frame from wrong identity {0}")]
    WrongIdentity(Ipv6Addr),
    /// Epoch time outside the acceptance window.
    #[error("timestamp is {0} seconds off")]
    StaleTimestamp(i64),
    /// Signature mismatch.
    #[error("incorrect signature")]
    BadSignature,
}

/// The validated pieces of a frame; the payload sits at
/// `&frame[FRAMING_LEN..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Operation requested by the peer.
    pub opcode: Opcode,
    /// Payload protocol (41 or 59).
    pub next_header: u8,
}

/// Build and sign a frame around `payload`.
pub fn pack(
    opcode: Opcode,
    next_header: u8,
    identity: Ipv6Addr,
    epoch: u32,
    secret: &SecretHash,
    payload: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAMING_LEN + payload.len());
    buf.put_u8((IDLEN_IPV6 << 4) | IDTYPE_INTEGER);
    buf.put_u8((SIGLEN_SHA1 << 4) | HASH_SHA1);
    buf.put_u8((AUTH_SHARED_SECRET << 4) | opcode as u8);
    buf.put_u8(next_header);
    buf.put_u32(epoch);
    buf.put_slice(&identity.octets());
    // The password digest occupies the slot while the frame is hashed.
    buf.put_slice(secret.as_bytes());
    buf.put_slice(payload);

    let signature: [u8; SIGNATURE_LEN] = Sha1::digest(&buf).into();
    buf[SIGNATURE_OFFSET..FRAMING_LEN].copy_from_slice(&signature);
    buf
}

/// Validate an incoming frame in place.
///
/// Checks, in order: length, fixed header fields, identity, epoch window,
/// signature. On success the signature slot is left holding the password
/// digest; the payload bytes are untouched.
pub fn verify(
    frame: &mut [u8],
    expected_identity: &Ipv6Addr,
    secret: &SecretHash,
    now: u64,
) -> Result<Frame, AyiyaError> {
    if frame.len() < FRAMING_LEN {
        return Err(AyiyaError::Truncated(frame.len()));
    }

    let idlen = frame[0] >> 4;
    let idtype = frame[0] & 0x0f;
    let siglen = frame[1] >> 4;
    let hshmeth = frame[1] & 0x0f;
    let autmeth = frame[2] >> 4;
    let opcode = frame[2] & 0x0f;
    let next_header = frame[3];

    if idlen != IDLEN_IPV6 {
        return Err(AyiyaError::BadHeader { field: "idlen", value: idlen });
    }
    if idtype != IDTYPE_INTEGER {
        return Err(AyiyaError::BadHeader { field: "idtype", value: idtype });
    }
    if siglen != SIGLEN_SHA1 {
        return Err(AyiyaError::BadHeader { field: "siglen", value: siglen });
    }
    if hshmeth != HASH_SHA1 {
        return Err(AyiyaError::BadHeader { field: "hshmeth", value: hshmeth });
    }
    if autmeth != AUTH_SHARED_SECRET {
        return Err(AyiyaError::BadHeader { field: "autmeth", value: autmeth });
    }
    if next_header != NEXT_HEADER_IPV6 && next_header != NEXT_HEADER_NONE {
        return Err(AyiyaError::BadHeader {
            field: "next_header",
            value: next_header,
        });
    }
    let Some(opcode) = Opcode::from_nibble(opcode) else {
        return Err(AyiyaError::BadHeader { field: "opcode", value: opcode });
    };

    let mut identity = [0u8; IDENTITY_LEN];
    identity.copy_from_slice(&frame[HEADER_LEN..HEADER_LEN + IDENTITY_LEN]);
    let identity = Ipv6Addr::from(identity);
    if identity != *expected_identity {
        return Err(AyiyaError::WrongIdentity(identity));
    }

    let epoch = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let skew = now as i64 - epoch as i64;
    if skew.unsigned_abs() > EPOCH_TOLERANCE {
        return Err(AyiyaError::StaleTimestamp(skew));
    }

    let mut their_signature = [0u8; SIGNATURE_LEN];
    their_signature.copy_from_slice(&frame[SIGNATURE_OFFSET..FRAMING_LEN]);
    frame[SIGNATURE_OFFSET..FRAMING_LEN].copy_from_slice(secret.as_bytes());
    let our_signature: [u8; SIGNATURE_LEN] = Sha1::digest(&frame[..]).into();

    if their_signature != our_signature {
        return Err(AyiyaError::BadSignature);
    }

    Ok(Frame { opcode, next_header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const NOW: u64 = 1_300_000_000;

    fn identity() -> Ipv6Addr {
        "fe80::1".parse().unwrap()
    }

    /// A minimal IPv6 payload: 40 zero bytes with the version nibble set.
    fn ipv6_payload() -> [u8; 40] {
        let mut payload = [0u8; 40];
        payload[0] = 6 << 4;
        payload
    }

    fn signed_frame() -> BytesMut {
        let secret = SecretHash::from_password("secret");
        pack(
            Opcode::Forward,
            NEXT_HEADER_IPV6,
            identity(),
            NOW as u32,
            &secret,
            &ipv6_payload(),
        )
    }

    #[test]
    fn secret_hash_is_sha1_of_password() {
        let secret = SecretHash::from_password("secret");
        assert_eq!(
            secret.as_bytes(),
            &hex!("e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4")
        );
    }

    #[test]
    fn round_trip() {
        let secret = SecretHash::from_password("secret");
        let mut frame = signed_frame();
        let parsed = verify(&mut frame, &identity(), &secret, NOW).unwrap();
        assert_eq!(parsed.opcode, Opcode::Forward);
        assert_eq!(parsed.next_header, NEXT_HEADER_IPV6);
        assert_eq!(&frame[FRAMING_LEN..], &ipv6_payload());
    }

    #[test]
    fn wrong_password_rejected() {
        let secret = SecretHash::from_password("wrong");
        let mut frame = signed_frame();
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW),
            Err(AyiyaError::BadSignature)
        );
    }

    #[test]
    fn payload_bit_flip_rejected() {
        let secret = SecretHash::from_password("secret");
        let mut frame = signed_frame();
        frame[FRAMING_LEN + 9] ^= 0x01;
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW),
            Err(AyiyaError::BadSignature)
        );
    }

    #[test]
    fn signature_bit_flip_rejected() {
        let secret = SecretHash::from_password("secret");
        let mut frame = signed_frame();
        frame[SIGNATURE_OFFSET] ^= 0x80;
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW),
            Err(AyiyaError::BadSignature)
        );
    }

    #[test]
    fn epoch_boundary() {
        let secret = SecretHash::from_password("secret");

        let mut frame = signed_frame();
        assert!(verify(&mut frame, &identity(), &secret, NOW + EPOCH_TOLERANCE).is_ok());

        let mut frame = signed_frame();
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW + EPOCH_TOLERANCE + 1),
            Err(AyiyaError::StaleTimestamp(EPOCH_TOLERANCE as i64 + 1))
        );

        let mut frame = signed_frame();
        assert!(verify(&mut frame, &identity(), &secret, NOW - EPOCH_TOLERANCE).is_ok());
    }

    #[test]
    fn truncated_frame_rejected() {
        let secret = SecretHash::from_password("secret");
        let mut frame = [0u8; FRAMING_LEN - 1];
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW),
            Err(AyiyaError::Truncated(FRAMING_LEN - 1))
        );
    }

    #[test]
    fn deviant_header_field_rejected() {
        let secret = SecretHash::from_password("secret");
        let mut frame = signed_frame();
        frame[0] = (3 << 4) | IDTYPE_INTEGER;
        assert_eq!(
            verify(&mut frame, &identity(), &secret, NOW),
            Err(AyiyaError::BadHeader { field: "idlen", value: 3 })
        );
    }

    #[test]
    fn wrong_identity_rejected() {
        let secret = SecretHash::from_password("secret");
        let mut frame = signed_frame();
        let other: Ipv6Addr = "fe80::2".parse().unwrap();
        assert_eq!(
            verify(&mut frame, &other, &secret, NOW),
            Err(AyiyaError::WrongIdentity(identity()))
        );
    }

    #[test]
    fn noop_beat_is_bare_framing() {
        let secret = SecretHash::from_password("secret");
        let mut frame = pack(
            Opcode::Noop,
            NEXT_HEADER_NONE,
            identity(),
            NOW as u32,
            &secret,
            &[],
        );
        assert_eq!(frame.len(), FRAMING_LEN);
        let parsed = verify(&mut frame, &identity(), &secret, NOW).unwrap();
        assert_eq!(parsed.opcode, Opcode::Noop);
        assert_eq!(parsed.next_header, NEXT_HEADER_NONE);
    }
}
