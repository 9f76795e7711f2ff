//! MySQL client/server protocol implementation
//!
//! This module covers the subset needed for connection brokering:
//! - Packet framing and reassembly
//! - Handshake v10 and HandshakeResponse41
//! - TLS upgrade request
//! - Authentication replies (OK, ERR, auth switch, more data)
//! - COM_QUERY text result sets, COM_PING and COM_QUIT

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::{decode_packet, PacketReader};
pub use encode::{encode_message, frame_packet};
pub use message::{
    AuthReply, AuthSwitchRequest, ColumnDefinition, Command, FrontendMessage, Handshake,
    HandshakeResponse, OkPacket, Packet, QueryReply, ResultSet,
};
