//! Packet framing: `<VarInt length><VarInt id><payload>`
//!
//! `length` counts the id plus the payload. Frames longer than
//! [`MAX_PACKET_LENGTH`] are rejected on read.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::types::{
    put_string, put_ushort, put_varint, read_varint, varint_len, Scanner,
};

pub const MAX_PACKET_LENGTH: i32 = 4096;

/// Disconnect frame id. The true id varies per protocol version; this value
/// is fixed for bit-exact compatibility with the deployed behavior.
pub const DISCONNECT_PACKET_ID: i32 = 0x1A;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Sequential reader over the payload.
    pub fn scanner(&self) -> Scanner<'_> {
        Scanner::new(&self.payload)
    }

    /// Fail unless the frame carries the expected id.
    pub fn expect_id(&self, expected: i32) -> Result<()> {
        if self.id != expected {
            return Err(ProxyError::UnexpectedPacket { expected, got: self.id });
        }
        Ok(())
    }
}

/// Read one frame. Consumes exactly `length - len(id)` payload bytes; a
/// short read on the payload fails.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet> {
    let (length, _) = read_varint(r).await?;
    if !(0..=MAX_PACKET_LENGTH).contains(&length) {
        return Err(ProxyError::InvalidLength(length));
    }

    let (id, id_len) = read_varint(r).await?;
    if id < 0 {
        return Err(ProxyError::NegativeId(id));
    }

    let payload_len = length - id_len as i32;
    if payload_len < 0 {
        return Err(ProxyError::InvalidLength(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    tokio::io::AsyncReadExt::read_exact(r, &mut payload).await?;

    Ok(Packet { id, payload })
}

/// Serialize and send one frame: length, id, then payload, in a single
/// write. Transport failures surface to the caller; this layer never
/// retries.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    w: &mut W,
    id: i32,
    payload: &[u8],
) -> Result<()> {
    let length = varint_len(id) + payload.len();
    let mut buf = Vec::with_capacity(varint_len(length as i32) + length);
    put_varint(&mut buf, length as i32);
    put_varint(&mut buf, id);
    buf.extend_from_slice(payload);

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    text: &'a str,
}

/// Encode a disconnect frame: id 0x1A, payload `String({"text":reason})`.
pub fn pack_disconnect(reason: &str) -> Vec<u8> {
    let json = serde_json::to_string(&ChatMessage { text: reason })
        .expect("chat message serializes");
    let mut payload = Vec::with_capacity(json.len() + 3);
    put_string(&mut payload, &json);
    payload
}

/// Send a disconnect frame with a human-readable reason.
pub async fn send_disconnect<W: AsyncWrite + Unpin>(w: &mut W, reason: &str) -> Result<()> {
    let payload = pack_disconnect(reason);
    write_packet(w, DISCONNECT_PACKET_ID, &payload).await
}

/// The first Minecraft frame: protocol version, server address, port and
/// the intended next state (1 = status, 2 = login).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: i32,
    pub address: String,
    pub port: u16,
    pub next_state: i32,
}

/// Marker suffixed onto the handshake address by Forge Mod Loader clients.
pub const FML_MARKER: &str = "\x00FML\x00";

impl Handshake {
    pub fn scan(packet: &Packet) -> Result<Self> {
        packet.expect_id(0x00)?;
        let mut s = packet.scanner();
        Ok(Self {
            protocol: s.var_int()?,
            address: s.string()?,
            port: s.ushort()?,
            next_state: s.var_int()?,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        put_varint(&mut payload, self.protocol);
        put_string(&mut payload, &self.address);
        put_ushort(&mut payload, self.port);
        put_varint(&mut payload, self.next_state);
        payload
    }

    pub fn is_fml(&self) -> bool {
        self.address.ends_with(FML_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(id: i32, payload: &[u8]) -> Packet {
        let mut wire = Vec::new();
        write_packet(&mut wire, id, payload).await.unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        read_packet(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_packet_roundtrip() {
        for (id, payload) in [
            (0x00, Vec::new()),
            (0x01, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            (0x1a, vec![0u8; 4000]),
            (300, b"payload".to_vec()),
        ] {
            let pkt = roundtrip(id, &payload).await;
            assert_eq!(pkt.id, id);
            assert_eq!(pkt.payload, payload);
        }
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let mut wire = Vec::new();
        put_varint(&mut wire, 5000);
        put_varint(&mut wire, 0);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(matches!(
            read_packet(&mut cursor).await,
            Err(ProxyError::InvalidLength(5000))
        ));
    }

    #[tokio::test]
    async fn test_length_below_id_rejected() {
        // length=0 leaves no room for the one-byte id it must cover
        let wire = vec![0x00, 0x05];
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_packet(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_rejected() {
        let mut wire = Vec::new();
        write_packet(&mut wire, 0x00, &[1, 2, 3, 4]).await.unwrap();
        wire.truncate(wire.len() - 2);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_packet(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let hs = Handshake {
            protocol: 47,
            address: "play.example.com".to_string(),
            port: 25565,
            next_state: 2,
        };
        let pkt = roundtrip(0x00, &hs.pack()).await;
        assert_eq!(Handshake::scan(&pkt).unwrap(), hs);
    }

    #[test]
    fn test_fml_detection() {
        let mut hs = Handshake {
            protocol: 47,
            address: "mc.example.com\x00FML\x00".to_string(),
            port: 25565,
            next_state: 2,
        };
        assert!(hs.is_fml());
        hs.address = "mc.example.com".to_string();
        assert!(!hs.is_fml());
    }

    #[test]
    fn test_pack_disconnect_payload() {
        let payload = pack_disconnect("The server is full");
        let mut scanner = Scanner::new(&payload);
        assert_eq!(scanner.string().unwrap(), r#"{"text":"The server is full"}"#);
    }

    #[test]
    fn test_expect_id() {
        let pkt = Packet { id: 0x01, payload: Vec::new() };
        assert!(pkt.expect_id(0x01).is_ok());
        assert!(matches!(
            pkt.expect_id(0x00),
            Err(ProxyError::UnexpectedPacket { expected: 0x00, got: 0x01 })
        ));
    }
}
