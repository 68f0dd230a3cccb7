use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, ErrorKind, Result};

pub const WIRE_VERSION: u8 = 1;
pub const MSG_HELLO: u8 = 1;
pub const MSG_REPLY: u8 = 2;

pub const NONCE_SIZE: usize = 16;
pub const PROOF_SIZE: usize = 32;
pub const MAC_SIZE: usize = 16;

const LENGTH_PREFIX_SIZE: usize = 4;
const SEQ_NUM_SIZE: usize = 8;

/// version + qop + sequence number + truncated MAC.
pub const TRAILER_SIZE: usize = 2 + SEQ_NUM_SIZE + MAC_SIZE;

/// One handshake token. `flags` carries the requested (hello) or negotiated
/// (reply) context flag bits; `proof` authenticates the sender against the
/// shared key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub msg_type: u8,
    pub flags: u32,
    pub principal: String,
    pub nonce: [u8; NONCE_SIZE],
    pub proof: [u8; PROOF_SIZE],
}

/// Serializes a handshake message behind a little-endian length prefix, so a
/// receiver can tell a truncated token from a malformed one.
pub fn write_message(message: &HandshakeMessage) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(64 + message.principal.len());
    payload.write_u8(WIRE_VERSION)?;
    payload.write_u8(message.msg_type)?;
    payload.write_u32::<LittleEndian>(message.flags)?;
    payload.write_u16::<LittleEndian>(message.principal.len() as u16)?;
    payload.extend_from_slice(message.principal.as_bytes());
    payload.extend_from_slice(&message.nonce);
    payload.extend_from_slice(&message.proof);

    let mut token = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    token.write_u32::<LittleEndian>(payload.len() as u32)?;
    token.extend_from_slice(&payload);

    Ok(token)
}

/// Parses a handshake token. A short buffer yields
/// [`ErrorKind::IncompleteToken`] with the exact number of bytes still
/// required; an oversized length prefix, or anything structurally wrong past
/// it, is a [`ErrorKind::ProtocolViolation`].
pub fn read_message(token: &[u8]) -> Result<HandshakeMessage> {
    if token.len() < LENGTH_PREFIX_SIZE {
        return Err(Error::new(
            ErrorKind::IncompleteToken {
                bytes_needed: LENGTH_PREFIX_SIZE - token.len(),
            },
            "the token length prefix is truncated",
        ));
    }

    let declared = u32::from_le_bytes(token[..LENGTH_PREFIX_SIZE].try_into().expect("prefix size checked")) as usize;
    if declared > super::MAX_TOKEN_LEN as usize {
        // The prefix is attacker-controlled; never ask the caller to buffer
        // more than the advertised maximum token size.
        return Err(malformed("declared token length exceeds the maximum token size"));
    }
    let total = LENGTH_PREFIX_SIZE + declared;
    if token.len() < total {
        return Err(Error::new(
            ErrorKind::IncompleteToken {
                bytes_needed: total - token.len(),
            },
            "the token payload is truncated",
        ));
    }
    if token.len() > total {
        return Err(malformed("trailing bytes after the declared token length"));
    }

    let mut cursor = Cursor::new(&token[LENGTH_PREFIX_SIZE..]);

    let version = cursor.read_u8().map_err(|_| malformed("token too short"))?;
    if version != WIRE_VERSION {
        return Err(malformed("unsupported token version"));
    }

    let msg_type = cursor.read_u8().map_err(|_| malformed("token too short"))?;
    if msg_type != MSG_HELLO && msg_type != MSG_REPLY {
        return Err(malformed("unknown handshake message type"));
    }

    let flags = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("token too short"))?;

    let principal_len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| malformed("token too short"))? as usize;
    let mut principal = vec![0; principal_len];
    cursor
        .read_exact(&mut principal)
        .map_err(|_| malformed("token too short"))?;
    let principal = String::from_utf8(principal).map_err(|_| malformed("principal is not valid UTF-8"))?;

    let mut nonce = [0; NONCE_SIZE];
    cursor.read_exact(&mut nonce).map_err(|_| malformed("token too short"))?;

    let mut proof = [0; PROOF_SIZE];
    cursor.read_exact(&mut proof).map_err(|_| malformed("token too short"))?;

    if cursor.position() as usize != declared {
        return Err(malformed("trailing bytes inside the token payload"));
    }

    Ok(HandshakeMessage {
        msg_type,
        flags,
        principal,
        nonce,
        proof,
    })
}

/// The per-message protection trailer, carried in the `Token` buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub qop: u8,
    pub sequence_number: u64,
    pub mac: [u8; MAC_SIZE],
}

pub fn write_trailer(trailer: &Trailer) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(TRAILER_SIZE);
    buf.write_u8(WIRE_VERSION)?;
    buf.write_u8(trailer.qop)?;
    buf.write_u64::<LittleEndian>(trailer.sequence_number)?;
    buf.extend_from_slice(&trailer.mac);

    Ok(buf)
}

/// Parses a protection trailer. Any structural mismatch means the message is
/// no longer trustworthy, so everything here maps to
/// [`ErrorKind::MessageAltered`].
pub fn read_trailer(buf: &[u8]) -> Result<Trailer> {
    if buf.len() != TRAILER_SIZE {
        return Err(Error::new(ErrorKind::MessageAltered, "invalid protection trailer size"));
    }
    if buf[0] != WIRE_VERSION {
        return Err(Error::new(
            ErrorKind::MessageAltered,
            "unsupported protection trailer version",
        ));
    }

    let qop = buf[1];
    let sequence_number = u64::from_le_bytes(buf[2..2 + SEQ_NUM_SIZE].try_into().expect("trailer size checked"));
    let mut mac = [0; MAC_SIZE];
    mac.copy_from_slice(&buf[2 + SEQ_NUM_SIZE..]);

    Ok(Trailer {
        qop,
        sequence_number,
        mac,
    })
}

fn malformed(description: &str) -> Error {
    Error::new(ErrorKind::ProtocolViolation, format!("malformed token: {}", description))
}
