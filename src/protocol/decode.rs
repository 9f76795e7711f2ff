//! Protocol message decoding
//!
//! MySQL packets carry no type tag, so payloads are decoded by the phase the
//! connection is in: handshake, authentication, or command replies.

use super::constants::{capabilities::*, markers, MAX_PAYLOAD_LEN, MAX_REASSEMBLED_LEN};
use super::message::{
    AuthReply, AuthSwitchRequest, ColumnDefinition, Handshake, OkPacket, Packet, QueryReply,
};
use crate::error::ServerError;
use bytes::{Bytes, BytesMut};
use std::io;

/// Decode one framed packet from the front of `data`
///
/// Returns the packet and the number of bytes consumed; the caller advances
/// the buffer. An incomplete packet yields `UnexpectedEof` so the caller can
/// read more bytes and try again.
pub fn decode_packet(data: &BytesMut) -> io::Result<(Packet, usize)> {
    if data.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete packet header",
        ));
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], 0]) as usize;
    let sequence = data[3];

    if data.len() < 4 + len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete packet body",
        ));
    }

    let payload = Bytes::copy_from_slice(&data[4..4 + len]);
    Ok((Packet { sequence, payload }, 4 + len))
}

/// Whether a payload of this length continues in the next packet
pub fn is_continued(len: usize) -> bool {
    len == MAX_PAYLOAD_LEN
}

/// Reject reassembled payloads past the configured ceiling
pub fn check_reassembled_len(len: usize) -> io::Result<()> {
    if len > MAX_REASSEMBLED_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "payload length {} exceeds maximum allowed {}",
                len, MAX_REASSEMBLED_LEN
            ),
        ));
    }
    Ok(())
}

/// Decode the server's initial handshake (protocol v10)
pub fn decode_handshake(payload: &[u8]) -> io::Result<Handshake> {
    let mut r = PacketReader::new(payload);

    let protocol_version = r.read_u8()?;
    if protocol_version != super::constants::PROTOCOL_VERSION {
        return Err(invalid(format!(
            "unsupported handshake protocol version {}",
            protocol_version
        )));
    }

    let server_version = r.read_null_terminated()?;
    let connection_id = r.read_u32()?;
    let mut scramble = r.take(8)?.to_vec();
    r.skip(1)?;
    let mut capabilities = u32::from(r.read_u16()?);

    let mut collation = 0;
    let mut status_flags = 0;
    let mut auth_plugin = String::new();

    if !r.is_empty() {
        collation = r.read_u8()?;
        status_flags = r.read_u16()?;
        capabilities |= u32::from(r.read_u16()?) << 16;
        let auth_data_len = r.read_u8()? as usize;
        r.skip(10)?;

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_data_len.saturating_sub(8).max(13);
            let part2 = r.take(part2_len.min(r.remaining()))?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
        }

        if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            auth_plugin = r.read_null_terminated_or_rest();
        }
    }

    Ok(Handshake {
        protocol_version,
        server_version,
        connection_id,
        scramble,
        capabilities,
        collation,
        status_flags,
        auth_plugin,
    })
}

/// Decode a server reply received during authentication
pub fn decode_auth_reply(payload: &[u8], capabilities: u32) -> io::Result<AuthReply> {
    match payload.first() {
        Some(&markers::OK) => Ok(AuthReply::Ok(decode_ok(payload, capabilities)?)),
        Some(&markers::ERR) => Ok(AuthReply::Err(decode_err(payload)?)),
        Some(&markers::EOF) => {
            let mut r = PacketReader::new(&payload[1..]);
            if r.is_empty() {
                // Pre-4.1 servers asking for the old password hash
                return Ok(AuthReply::Switch(AuthSwitchRequest {
                    plugin: "mysql_old_password".to_string(),
                    data: Vec::new(),
                }));
            }
            let plugin = r.read_null_terminated_or_rest();
            let data = r.rest();
            let data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
            Ok(AuthReply::Switch(AuthSwitchRequest { plugin, data }))
        }
        Some(&markers::AUTH_MORE_DATA) => Ok(AuthReply::MoreData(payload[1..].to_vec())),
        Some(other) => Err(invalid(format!(
            "unexpected packet 0x{:02X} during authentication",
            other
        ))),
        None => Err(invalid("empty packet during authentication")),
    }
}

/// Decode the first reply to COM_QUERY
pub fn decode_query_reply(payload: &[u8], capabilities: u32) -> io::Result<QueryReply> {
    match payload.first() {
        Some(&markers::OK) => Ok(QueryReply::Ok(decode_ok(payload, capabilities)?)),
        Some(&markers::ERR) => Ok(QueryReply::Err(decode_err(payload)?)),
        Some(&markers::LOCAL_INFILE) => Ok(QueryReply::LocalInfile(
            String::from_utf8_lossy(&payload[1..]).to_string(),
        )),
        Some(_) => {
            let mut r = PacketReader::new(payload);
            let column_count = r.read_lenenc_int()?;
            Ok(QueryReply::ResultSet { column_count })
        }
        None => Err(invalid("empty query reply")),
    }
}

/// Decode an OK packet (header 0x00, or 0xFE when it terminates a result set)
pub fn decode_ok(payload: &[u8], capabilities: u32) -> io::Result<OkPacket> {
    let mut r = PacketReader::new(payload);
    r.skip(1)?;
    let affected_rows = r.read_lenenc_int()?;
    let last_insert_id = r.read_lenenc_int()?;

    let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
        (r.read_u16()?, r.read_u16()?)
    } else if capabilities & CLIENT_TRANSACTIONS != 0 {
        (r.read_u16()?, 0)
    } else {
        (0, 0)
    };

    let info = String::from_utf8_lossy(r.rest()).to_string();

    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

/// Decode an ERR packet
pub fn decode_err(payload: &[u8]) -> io::Result<ServerError> {
    let mut r = PacketReader::new(payload);
    let marker = r.read_u8()?;
    if marker != markers::ERR {
        return Err(invalid("not an ERR packet"));
    }
    let code = r.read_u16()?;

    // Errors sent before capability negotiation carry no SQLSTATE
    let sql_state = if r.peek() == Some(b'#') {
        r.skip(1)?;
        Some(String::from_utf8_lossy(r.take(5)?).to_string())
    } else {
        None
    };

    let message = String::from_utf8_lossy(r.rest()).to_string();

    Ok(ServerError {
        code,
        sql_state,
        message,
    })
}

/// Whether a payload ends a column or row sequence
///
/// With `CLIENT_DEPRECATE_EOF` the terminator is an OK packet with a 0xFE
/// header; otherwise it is a classic EOF packet. Both are shorter than any
/// row that could start with a 0xFE length prefix.
pub fn is_terminator(payload: &[u8], capabilities: u32) -> bool {
    if payload.first() != Some(&markers::EOF) {
        return false;
    }
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        payload.len() < MAX_PAYLOAD_LEN
    } else {
        payload.len() < 9
    }
}

/// Server status flags carried by a terminator packet
pub fn decode_terminator_status(payload: &[u8], capabilities: u32) -> io::Result<u16> {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        return Ok(decode_ok(payload, capabilities)?.status_flags);
    }
    let mut r = PacketReader::new(payload);
    r.skip(1)?;
    if r.remaining() < 4 {
        return Ok(0);
    }
    let _warnings = r.read_u16()?;
    r.read_u16()
}

/// Decode a ColumnDefinition41 packet
pub fn decode_column_definition(payload: &[u8]) -> io::Result<ColumnDefinition> {
    let mut r = PacketReader::new(payload);
    let _catalog = r.read_lenenc_bytes()?;
    let schema = r.read_lenenc_string()?;
    let table = r.read_lenenc_string()?;
    let _org_table = r.read_lenenc_bytes()?;
    let name = r.read_lenenc_string()?;
    let _org_name = r.read_lenenc_bytes()?;
    let _fixed_len = r.read_lenenc_int()?;
    let collation = r.read_u16()?;
    let column_length = r.read_u32()?;
    let column_type = r.read_u8()?;
    let flags = r.read_u16()?;
    let decimals = r.read_u8()?;

    Ok(ColumnDefinition {
        schema,
        table,
        name,
        collation,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

/// Decode a text protocol row with `columns` values
pub fn decode_text_row(payload: &[u8], columns: usize) -> io::Result<Vec<Option<String>>> {
    let mut r = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns);

    for _ in 0..columns {
        if r.peek() == Some(markers::NULL_VALUE) {
            r.skip(1)?;
            values.push(None);
        } else {
            values.push(Some(r.read_lenenc_string()?));
        }
    }

    Ok(values)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Cursor over a packet payload
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether everything has been read
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consume `n` bytes
    pub fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("need {} bytes, {} left", n, self.remaining()),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> io::Result<()> {
        self.take(n).map(|_| ())
    }

    /// Everything not yet read
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length-encoded integer; NULL (0xFB) and ERR (0xFF) prefixes are rejected
    pub fn read_lenenc_int(&mut self) -> io::Result<u64> {
        match self.read_u8()? {
            n @ 0x00..=0xFA => Ok(u64::from(n)),
            0xFC => Ok(u64::from(self.read_u16()?)),
            0xFD => {
                let b = self.take(3)?;
                Ok(u64::from(u32::from_le_bytes([b[0], b[1], b[2], 0])))
            }
            0xFE => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_le_bytes(raw))
            }
            other => Err(invalid(format!(
                "invalid length-encoded integer prefix 0x{:02X}",
                other
            ))),
        }
    }

    /// Length-encoded byte string
    pub fn read_lenenc_bytes(&mut self) -> io::Result<&'a [u8]> {
        let len = self.read_lenenc_int()?;
        let len = usize::try_from(len).map_err(|_| invalid("length overflows usize"))?;
        self.take(len)
    }

    /// Length-encoded string, lossily decoded as UTF-8
    pub fn read_lenenc_string(&mut self) -> io::Result<String> {
        Ok(String::from_utf8_lossy(self.read_lenenc_bytes()?).to_string())
    }

    /// NUL-terminated string
    pub fn read_null_terminated(&mut self) -> io::Result<String> {
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid("missing null terminator"))?;
        let value = String::from_utf8_lossy(&self.data[self.pos..self.pos + end]).to_string();
        self.pos += end + 1;
        Ok(value)
    }

    /// NUL-terminated string, or the rest of the payload if no NUL follows
    pub fn read_null_terminated_or_rest(&mut self) -> String {
        match self.read_null_terminated() {
            Ok(value) => value,
            Err(_) => String::from_utf8_lossy(self.rest()).to_string(),
        }
    }
}
