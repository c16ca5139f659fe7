//! Byte-signature protocol detection.
//!
//! # Responsibilities
//! - Classify a connection from its first bytes
//! - Distinguish "need more bytes" from "definitely unknown"
//!
//! Every check only reads the slice it is given; nothing here touches
//! shared state.

use thiserror::Error;

use crate::inspector::protocol::Protocol;

/// Absolute minimum number of bytes before any detection is attempted.
pub const MIN_BYTES: usize = 3;

/// Bytes a caller should try to buffer for reliable detection.
pub const RECOMMENDED_BYTES: usize = 16;

const HTTP_PREFIXES: [&[u8]; 10] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
    b"HTTP/",
];

/// MySQL v10 handshake protocol version byte.
const MYSQL_GREETING_VERSION: u8 = 0x0a;
/// Highest MySQL command byte treated as a plausible client command.
const MYSQL_MAX_COMMAND: u8 = 0x1f;
const MYSQL_MAX_PACKET_LEN: u32 = 0x00ff_ffff;

/// PostgreSQL protocol 3.0 (`196608`).
const POSTGRES_V3: u32 = 0x0003_0000;
const POSTGRES_TAGS: [u8; 5] = [b'Q', b'S', b'P', b'X', b'p'];

/// OP_UPDATE, OP_INSERT, OP_QUERY, OP_GET_MORE, OP_DELETE, OP_KILL_CURSORS, OP_MSG.
const MONGO_OPCODES: [u32; 7] = [2001, 2002, 2004, 2005, 2006, 2007, 2013];

const RESP_MARKERS: [u8; 5] = [b'+', b'-', b':', b'$', b'*'];
const RESP_LOOKAHEAD: usize = 20;
const REDIS_COMMANDS: [&[u8]; 6] = [b"PING", b"GET ", b"SET ", b"DEL ", b"AUTH ", b"SELECT "];
const REDIS_PREFIX_WINDOW: usize = 10;

/// RTMP C0 version byte.
const RTMP_VERSION: u8 = 0x03;
const RTMP_PROBE_LEN: usize = 9;

/// Errors returned by protocol detection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InspectError {
    /// Not enough bytes yet; buffer more and retry.
    #[error("insufficient data for protocol detection: got {got} bytes, need at least {needed}")]
    InsufficientData { got: usize, needed: usize },
}

/// Stateless protocol classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolInspector;

impl ProtocolInspector {
    pub fn new() -> Self {
        Self
    }

    /// Bytes a caller should try to collect before calling [`inspect`](Self::inspect).
    pub fn min_bytes_recommended(&self) -> usize {
        RECOMMENDED_BYTES
    }

    /// Detect the protocol spoken by the first bytes of a connection.
    ///
    /// Checks run in fixed priority order and the first match wins.
    /// Returns `Ok(Protocol::Unknown)` when nothing matches; that outcome
    /// will not change with more data from the same prefix.
    pub fn inspect(&self, data: &[u8]) -> Result<Protocol, InspectError> {
        if data.len() < MIN_BYTES {
            return Err(InspectError::InsufficientData {
                got: data.len(),
                needed: MIN_BYTES,
            });
        }

        let protocol = if is_http(data) {
            Protocol::Http
        } else if is_mysql(data) {
            Protocol::MySql
        } else if is_postgresql(data) {
            Protocol::PostgreSql
        } else if is_mongodb(data) {
            Protocol::MongoDb
        } else if is_redis(data) {
            Protocol::Redis
        } else if is_rtmp(data) {
            Protocol::Rtmp
        } else {
            Protocol::Unknown
        };

        Ok(protocol)
    }
}

fn is_http(data: &[u8]) -> bool {
    HTTP_PREFIXES.iter().any(|prefix| data.starts_with(prefix))
}

/// Packet header is a 3-byte little-endian length plus a sequence id, so
/// byte 4 is either the greeting's protocol version or a command byte.
fn is_mysql(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }

    if data[4] == MYSQL_GREETING_VERSION {
        return true;
    }

    if data[4] <= MYSQL_MAX_COMMAND {
        let packet_len = u32::from(data[0]) | u32::from(data[1]) << 8 | u32::from(data[2]) << 16;
        return packet_len > 0 && packet_len < MYSQL_MAX_PACKET_LEN;
    }

    false
}

fn is_postgresql(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }

    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version == POSTGRES_V3 {
        return true;
    }

    POSTGRES_TAGS.contains(&data[0])
}

/// Standard message header: length, requestID, responseTo, opCode (all LE i32).
fn is_mongodb(data: &[u8]) -> bool {
    if data.len() < 16 {
        return false;
    }

    let op_code = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
    MONGO_OPCODES.contains(&op_code)
}

fn is_redis(data: &[u8]) -> bool {
    if RESP_MARKERS.contains(&data[0]) {
        let limit = data.len().saturating_sub(1).min(RESP_LOOKAHEAD);
        if (1..limit).any(|i| data[i] == b'\r' && data[i + 1] == b'\n') {
            return true;
        }
    }

    let window = &data[..data.len().min(REDIS_PREFIX_WINDOW)];
    let upper = window.to_ascii_uppercase();
    REDIS_COMMANDS.iter().any(|cmd| upper.starts_with(cmd))
}

fn is_rtmp(data: &[u8]) -> bool {
    if data[0] != RTMP_VERSION {
        return false;
    }

    if data.len() >= RTMP_PROBE_LEN {
        return data[1..RTMP_PROBE_LEN].iter().any(|b| *b != 0);
    }

    true
}
