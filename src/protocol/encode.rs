//! Protocol message encoding

use super::constants::{capabilities::*, commands, MAX_PACKET_SIZE, MAX_PAYLOAD_LEN};
use super::message::{Command, FrontendMessage, HandshakeResponse};
use bytes::{BufMut, BytesMut};
use std::io;

/// Encode a frontend message into an unframed payload
///
/// Use [`frame_packet`] to add packet headers before writing to the socket.
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::SslRequest {
            capabilities,
            collation,
        } => {
            encode_ssl_request(&mut buf, *capabilities, *collation);
        }
        FrontendMessage::HandshakeResponse(response) => {
            encode_handshake_response(&mut buf, response)?;
        }
        FrontendMessage::AuthData(data) => {
            buf.put_slice(data);
        }
        FrontendMessage::Command(command) => {
            encode_command(&mut buf, command);
        }
    }

    Ok(buf)
}

/// Split a payload into packets and append them to `out`
///
/// Returns the sequence id the next packet must use. A payload whose length is
/// an exact multiple of the maximum packet size is terminated by an empty packet.
pub fn frame_packet(out: &mut BytesMut, mut sequence: u8, payload: &[u8]) -> u8 {
    if payload.is_empty() {
        put_header(out, 0, sequence);
        return sequence.wrapping_add(1);
    }

    for chunk in payload.chunks(MAX_PAYLOAD_LEN) {
        put_header(out, chunk.len(), sequence);
        out.put_slice(chunk);
        sequence = sequence.wrapping_add(1);
    }

    if payload.len() % MAX_PAYLOAD_LEN == 0 {
        put_header(out, 0, sequence);
        sequence = sequence.wrapping_add(1);
    }

    sequence
}

fn put_header(out: &mut BytesMut, len: usize, sequence: u8) {
    let len = len as u32;
    out.put_u8((len & 0xFF) as u8);
    out.put_u8(((len >> 8) & 0xFF) as u8);
    out.put_u8(((len >> 16) & 0xFF) as u8);
    out.put_u8(sequence);
}

fn encode_ssl_request(buf: &mut BytesMut, capabilities: u32, collation: u8) {
    buf.put_u32_le(capabilities | CLIENT_SSL);
    buf.put_u32_le(MAX_PACKET_SIZE);
    buf.put_u8(collation);
    buf.put_bytes(0, 23);
}

fn encode_handshake_response(buf: &mut BytesMut, resp: &HandshakeResponse) -> io::Result<()> {
    let caps = resp.capabilities;
    if caps & CLIENT_PROTOCOL_41 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "handshake response requires CLIENT_PROTOCOL_41",
        ));
    }

    buf.put_u32_le(caps);
    buf.put_u32_le(resp.max_packet_size);
    buf.put_u8(resp.collation);
    buf.put_bytes(0, 23);
    put_null_terminated(buf, &resp.username)?;

    if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        put_lenenc_bytes(buf, &resp.auth_response);
    } else if caps & CLIENT_SECURE_CONNECTION != 0 {
        let len = u8::try_from(resp.auth_response.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "auth response longer than 255 bytes")
        })?;
        buf.put_u8(len);
        buf.put_slice(&resp.auth_response);
    } else {
        buf.put_slice(&resp.auth_response);
        buf.put_u8(0);
    }

    if caps & CLIENT_CONNECT_WITH_DB != 0 {
        put_null_terminated(buf, resp.database.as_deref().unwrap_or(""))?;
    }

    if caps & CLIENT_PLUGIN_AUTH != 0 {
        put_null_terminated(buf, &resp.auth_plugin)?;
    }

    if caps & CLIENT_CONNECT_ATTRS != 0 {
        let mut attrs = BytesMut::new();
        for (key, value) in &resp.attributes {
            put_lenenc_bytes(&mut attrs, key.as_bytes());
            put_lenenc_bytes(&mut attrs, value.as_bytes());
        }
        put_lenenc_bytes(buf, &attrs);
    }

    Ok(())
}

fn encode_command(buf: &mut BytesMut, command: &Command) {
    match command {
        Command::Query(sql) => {
            buf.put_u8(commands::COM_QUERY);
            buf.put_slice(sql.as_bytes());
        }
        Command::Ping => buf.put_u8(commands::COM_PING),
        Command::Quit => buf.put_u8(commands::COM_QUIT),
    }
}

fn put_null_terminated(buf: &mut BytesMut, value: &str) -> io::Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string contains NUL byte",
        ));
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Append a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xFA => buf.put_u8(value as u8),
        0xFB..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_uint_le(value, 3);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

/// Append a length-encoded byte string
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::auth_plugins;

    fn response(caps: u32) -> HandshakeResponse {
        HandshakeResponse {
            capabilities: caps,
            max_packet_size: MAX_PACKET_SIZE,
            collation: 45,
            username: "root".into(),
            auth_response: vec![0xAA; 20],
            database: None,
            auth_plugin: auth_plugins::MYSQL_NATIVE_PASSWORD.into(),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn test_frame_small_packet() {
        let mut out = BytesMut::new();
        let next = frame_packet(&mut out, 0, &[0x0E]);
        assert_eq!(&out[..], &[1, 0, 0, 0, 0x0E]);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_frame_empty_payload() {
        let mut out = BytesMut::new();
        let next = frame_packet(&mut out, 3, &[]);
        assert_eq!(&out[..], &[0, 0, 0, 3]);
        assert_eq!(next, 4);
    }

    #[test]
    fn test_frame_exact_max_adds_terminator() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let mut out = BytesMut::new();
        let next = frame_packet(&mut out, 0, &payload);
        assert_eq!(next, 2);
        assert_eq!(out.len(), 4 + MAX_PAYLOAD_LEN + 4);
        assert_eq!(&out[..4], &[0xFF, 0xFF, 0xFF, 0]);
        assert_eq!(&out[out.len() - 4..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_ssl_request() {
        let buf = encode_message(&FrontendMessage::SslRequest {
            capabilities: CLIENT_PROTOCOL_41,
            collation: 45,
        })
        .unwrap();
        assert_eq!(buf.len(), 32);
        let caps = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_ne!(caps & CLIENT_SSL, 0);
        assert_eq!(buf[8], 45);
    }

    #[test]
    fn test_encode_handshake_response_lenenc() {
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let buf =
            encode_message(&FrontendMessage::HandshakeResponse(response(caps))).unwrap();

        // 4 caps + 4 max packet + 1 collation + 23 filler
        assert_eq!(&buf[32..37], b"root\0");
        assert_eq!(buf[37], 20);
        assert_eq!(&buf[38..58], &[0xAA; 20]);
        assert_eq!(&buf[58..], b"mysql_native_password\0");
    }

    #[test]
    fn test_encode_handshake_response_with_db_and_attrs() {
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_CONNECT_ATTRS;
        let mut resp = response(caps);
        resp.database = Some("mysql".into());
        resp.attributes = vec![("_client_name".into(), "mysql-broker".into())];
        let buf = encode_message(&FrontendMessage::HandshakeResponse(resp)).unwrap();

        let db_start = 32 + 5 + 1 + 20;
        assert_eq!(&buf[db_start..db_start + 6], b"mysql\0");
        let attrs = &buf[db_start + 6..];
        assert_eq!(attrs[0] as usize, attrs.len() - 1);
        assert_eq!(attrs[1], 12);
        assert_eq!(&attrs[2..14], b"_client_name");
    }

    #[test]
    fn test_encode_rejects_nul_in_username() {
        let mut resp = response(CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION);
        resp.username = "ro\0ot".into();
        let err = encode_message(&FrontendMessage::HandshakeResponse(resp)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_encode_commands() {
        let query = encode_message(&FrontendMessage::Command(Command::Query(
            "SELECT 1".into(),
        )))
        .unwrap();
        assert_eq!(query[0], commands::COM_QUERY);
        assert_eq!(&query[1..], b"SELECT 1");

        let ping = encode_message(&FrontendMessage::Command(Command::Ping)).unwrap();
        assert_eq!(&ping[..], &[commands::COM_PING]);
    }

    #[test]
    fn test_lenenc_int_widths() {
        let mut buf = BytesMut::new();
        put_lenenc_int(&mut buf, 250);
        put_lenenc_int(&mut buf, 251);
        put_lenenc_int(&mut buf, 70_000);
        put_lenenc_int(&mut buf, 1 << 32);
        assert_eq!(
            &buf[..],
            &[
                250, 0xFC, 251, 0, 0xFD, 0x70, 0x11, 0x01, 0xFE, 0, 0, 0, 0, 1, 0, 0, 0
            ]
        );
    }
}
