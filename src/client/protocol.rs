//! Client half of the MySQL wire protocol.
//!
//! Only what a monitor connection needs: packet framing, the initial
//! handshake, `mysql_native_password` authentication and result-set
//! primitives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio_util::codec::{Decoder, Encoder};

/// MySQL packet header size: 3 bytes length + 1 byte sequence.
pub const PACKET_HEADER_SIZE: usize = 4;

pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0E;

/// Capability flags the monitor client negotiates.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;

    /// CLIENT_DEPRECATE_EOF is intentionally left out; the result-set walker
    /// handles the EOF-terminated form every supported backend produces.
    pub const MONITOR_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
}

/// One wire packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// A single-command packet (COM_PING, COM_QUERY + statement).
    pub fn command(com: u8, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(com);
        payload.extend_from_slice(body);
        Self::new(0, payload.freeze())
    }

    fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// Packet codec for use with tokio `Framed`.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Initial handshake sent by the backend.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub capability_flags: u32,
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let _connection_id = buf.get_u32_le();

        let mut auth_plugin_data = Vec::with_capacity(20);
        auth_plugin_data.extend_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let _character_set = buf.get_u8();
        let _status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        if capability_flags & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8) as usize);
            if buf.len() < len {
                return None;
            }
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & capabilities::CLIENT_PLUGIN_AUTH != 0
            && !buf.is_empty()
        {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            capability_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// Build the handshake response packet for the monitor user.
pub fn encode_handshake_response(
    sequence_id: u8,
    capability_flags: u32,
    username: &str,
    auth_response: &[u8],
    auth_plugin_name: &str,
) -> Packet {
    let mut buf = BytesMut::new();

    buf.put_u32_le(capability_flags);
    buf.put_u32_le(16 * 1024 * 1024);
    buf.put_u8(0x21); // utf8_general_ci

    // Reserved
    buf.extend_from_slice(&[0u8; 23]);

    buf.extend_from_slice(username.as_bytes());
    buf.put_u8(0);

    if capability_flags & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        buf.put_u8(auth_response.len() as u8);
        buf.extend_from_slice(auth_response);
    } else {
        buf.extend_from_slice(auth_response);
        buf.put_u8(0);
    }

    if capability_flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        buf.extend_from_slice(auth_plugin_name.as_bytes());
        buf.put_u8(0);
    }

    Packet::new(sequence_id, buf.freeze())
}

/// Compute the `mysql_native_password` scramble:
/// `SHA1(password) XOR SHA1(auth_data + SHA1(SHA1(password)))`.
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Parsed ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub error_message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }
        let error_code = buf.get_u16_le();

        // Protocol 4.1 embeds "#xxxxx" sql-state before the message.
        if buf.first() == Some(&b'#') && buf.len() >= 6 {
            buf.advance(6);
        }

        Some(Self {
            error_code,
            error_message: String::from_utf8_lossy(buf).to_string(),
        })
    }
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

/// Parse a length-encoded integer, returning the value and bytes consumed.
pub fn parse_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Parse a length-encoded string. `None` value means SQL NULL (0xFB).
pub fn parse_lenenc_str(data: &[u8]) -> Option<(Option<String>, usize)> {
    if data.first() == Some(&0xFB) {
        return Some((None, 1));
    }

    let (len, header) = parse_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < header + len {
        return None;
    }

    let value = String::from_utf8_lossy(&data[header..header + len]).to_string();
    Some((Some(value), header + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::command(COM_QUERY, b"SELECT 1");
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 0);
        assert_eq!(&decoded.payload[..], b"\x03SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_packet_decode_needs_full_frame() {
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn test_auth_response_empty_password() {
        assert!(compute_auth_response("", b"12345678901234567890").is_empty());
        assert_eq!(compute_auth_response("pw", b"12345678901234567890").len(), 20);
    }

    #[test]
    fn test_err_packet_parse() {
        let mut payload = vec![0xFF, 0x15, 0x04]; // 1045
        payload.extend_from_slice(b"#28000Access denied");
        let err = ErrPacket::parse(&payload).unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.error_message, "Access denied");

        assert!(ErrPacket::parse(&[0x00]).is_none());
    }

    #[test]
    fn test_lenenc_parsing() {
        assert_eq!(parse_lenenc_int(&[0x05]), Some((5, 1)));
        assert_eq!(parse_lenenc_int(&[0xFC, 0x01, 0x02]), Some((0x0201, 3)));
        assert_eq!(parse_lenenc_str(&[0xFB]), Some((None, 1)));
        assert_eq!(
            parse_lenenc_str(&[0x02, b'o', b'k']),
            Some((Some("ok".into()), 3))
        );
        assert_eq!(parse_lenenc_str(&[0x05, b'x']), None);
    }

    #[test]
    fn test_classifier_packets() {
        assert!(is_ok_packet(&[0x00, 0x00]));
        assert!(is_err_packet(&[0xFF, 0x00]));
        assert!(is_eof_packet(&[0xFE, 0x00, 0x00]));
        assert!(!is_eof_packet(&[0xFE; 9]));
    }
}
