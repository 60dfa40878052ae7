//! Minimal Modbus/TCP client framing (MBAP + read registers).

use crate::protocols::ProtocolError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_READ_INPUT: u8 = 0x04;

/// Largest register count a single read request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

/// Encode a read-registers request ADU.
pub fn encode_read_request(transaction_id: u16, unit_id: u8, function: u8, address: u16, count: u16) -> [u8; 12] {
    let mut adu = [0u8; 12];
    adu[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    // protocol id 0, length = unit + pdu (5)
    adu[4..6].copy_from_slice(&6u16.to_be_bytes());
    adu[6] = unit_id;
    adu[7] = function;
    adu[8..10].copy_from_slice(&address.to_be_bytes());
    adu[10..12].copy_from_slice(&count.to_be_bytes());
    adu
}

/// Decode a read-registers response ADU into register values.
pub fn decode_read_response(transaction_id: u16, function: u8, adu: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if adu.len() < 9 {
        return Err(ProtocolError::Malformed("modbus response shorter than header".into()));
    }
    let tid = u16::from_be_bytes([adu[0], adu[1]]);
    if tid != transaction_id {
        return Err(ProtocolError::Malformed(format!("transaction id {} != {}", tid, transaction_id)));
    }
    let fc = adu[7];
    if fc == function | 0x80 {
        return Err(ProtocolError::Remote(format!("modbus exception code {}", adu[8])));
    }
    if fc != function {
        return Err(ProtocolError::Malformed(format!("unexpected function code {}", fc)));
    }
    let byte_count = adu[8] as usize;
    let data = adu
        .get(9..9 + byte_count)
        .ok_or_else(|| ProtocolError::Malformed("modbus byte count exceeds frame".into()))?;
    if byte_count % 2 != 0 {
        return Err(ProtocolError::Malformed("odd modbus byte count".into()));
    }
    Ok(data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}

/// One connection to a Modbus/TCP server.
pub struct ModbusClient {
    stream: TcpStream,
    unit_id: u8,
    next_tid: u16,
    timeout: Duration,
}

impl ModbusClient {
    pub async fn connect(addr: &str, unit_id: u8, timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(Self { stream, unit_id, next_tid: 1, timeout })
    }

    pub async fn read_registers(&mut self, function: u8, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ProtocolError::Malformed(format!("register count {} out of range", count)));
        }
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        let request = encode_read_request(tid, self.unit_id, function, address, count);

        let timeout = self.timeout;
        let stream = &mut self.stream;
        let io = async {
            stream.write_all(&request).await?;
            let mut header = [0u8; 7];
            stream.read_exact(&mut header).await?;
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            if !(2..=254).contains(&len) {
                return Err(ProtocolError::Malformed(format!("modbus length {}", len)));
            }
            let mut rest = vec![0u8; len - 1];
            stream.read_exact(&mut rest).await?;
            let mut adu = header.to_vec();
            adu.extend_from_slice(&rest);
            Ok::<Vec<u8>, ProtocolError>(adu)
        };
        let adu = tokio::time::timeout(timeout, io).await.map_err(|_| ProtocolError::Timeout)??;
        decode_read_response(tid, function, &adu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let adu = encode_read_request(7, 1, FC_READ_HOLDING, 100, 3);
        assert_eq!(adu, [0, 7, 0, 0, 0, 6, 1, 3, 0, 100, 0, 3]);
    }

    #[test]
    fn decodes_registers_and_exceptions() {
        let ok = [0, 7, 0, 0, 0, 7, 1, 3, 4, 0, 1, 0x04, 0xB0];
        assert_eq!(decode_read_response(7, FC_READ_HOLDING, &ok).unwrap(), vec![1, 1200]);

        let exc = [0, 7, 0, 0, 0, 3, 1, 0x83, 2];
        assert!(matches!(decode_read_response(7, FC_READ_HOLDING, &exc), Err(ProtocolError::Remote(_))));

        assert!(decode_read_response(8, FC_READ_HOLDING, &ok).is_err());
    }

    #[tokio::test]
    async fn reads_from_a_scripted_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 12];
            sock.read_exact(&mut req).await.unwrap();
            let reply = [req[0], req[1], 0, 0, 0, 5, req[6], 3, 2, 0, 2];
            sock.write_all(&reply).await.unwrap();
        });

        let mut client = ModbusClient::connect(&addr.to_string(), 1, Duration::from_secs(2)).await.unwrap();
        let regs = client.read_registers(FC_READ_HOLDING, 100, 1).await.unwrap();
        assert_eq!(regs, vec![2]);
    }
}
