//! FANUC FOCAS2 Ethernet session framing.
//!
//! Only the session open/close exchange is implemented; it is enough to tell
//! a live FOCAS listener from any other TCP service on port 8193.

use crate::protocols::ProtocolError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAGIC: [u8; 4] = [0xA0; 4];
const VERSION: u16 = 0x0001;
const OPEN_REQUEST: u16 = 0x0101;
const OPEN_RESPONSE: u16 = 0x0102;
const CLOSE_REQUEST: u16 = 0x0201;
const CLOSE_RESPONSE: u16 = 0x0202;
const MAX_BODY: usize = 4_096;

pub fn encode_packet(packet_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&packet_type.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Validate a 10-byte packet header and return `(packet_type, body_len)`.
pub fn decode_header(header: &[u8; 10]) -> Result<(u16, usize), ProtocolError> {
    if header[0..4] != MAGIC {
        return Err(ProtocolError::Malformed("missing FOCAS magic".into()));
    }
    let packet_type = u16::from_be_bytes([header[6], header[7]]);
    let len = u16::from_be_bytes([header[8], header[9]]) as usize;
    Ok((packet_type, len))
}

async fn exchange(stream: &mut TcpStream, request: &[u8], expected: u16) -> Result<Vec<u8>, ProtocolError> {
    stream.write_all(request).await?;
    let mut header = [0u8; 10];
    stream.read_exact(&mut header).await?;
    let (packet_type, len) = decode_header(&header)?;
    if packet_type != expected {
        return Err(ProtocolError::Malformed(format!("unexpected FOCAS packet type {:#06x}", packet_type)));
    }
    if len > MAX_BODY {
        return Err(ProtocolError::Malformed(format!("FOCAS body of {} bytes", len)));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Open and cleanly close one FOCAS session against `addr`.
pub async fn check_session(addr: &str, timeout: Duration) -> Result<(), ProtocolError> {
    let run = async {
        let mut stream = TcpStream::connect(addr).await?;
        exchange(&mut stream, &encode_packet(OPEN_REQUEST, &[0x00, 0x02]), OPEN_RESPONSE).await?;
        exchange(&mut stream, &encode_packet(CLOSE_REQUEST, &[]), CLOSE_RESPONSE).await?;
        Ok::<(), ProtocolError>(())
    };
    tokio::time::timeout(timeout, run).await.map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
pub(crate) mod test_server {
    use super::*;
    use tokio::net::TcpListener;

    /// Answer FOCAS open/close requests on one connection.
    pub async fn spawn() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            loop {
                let mut header = [0u8; 10];
                if sock.read_exact(&mut header).await.is_err() {
                    break;
                }
                let (packet_type, len) = decode_header(&header).unwrap();
                let mut body = vec![0u8; len];
                sock.read_exact(&mut body).await.unwrap();
                let reply = match packet_type {
                    OPEN_REQUEST => encode_packet(OPEN_RESPONSE, &[0x00, 0x02]),
                    _ => encode_packet(CLOSE_RESPONSE, &[]),
                };
                sock.write_all(&reply).await.unwrap();
            }
        });
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn open_request_layout() {
        let pkt = encode_packet(OPEN_REQUEST, &[0x00, 0x02]);
        assert_eq!(pkt, vec![0xA0, 0xA0, 0xA0, 0xA0, 0x00, 0x01, 0x01, 0x01, 0x00, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn rejects_foreign_header() {
        let header = *b"HTTP/1.1 2";
        assert!(decode_header(&header).is_err());
    }

    #[tokio::test]
    async fn session_round_trip() {
        let addr = test_server::spawn().await;
        check_session(&addr.to_string(), Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn non_focas_listener_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await;
        });
        assert!(check_session(&addr.to_string(), Duration::from_secs(1)).await.is_err());
    }
}
