//! A minimal RFC 5389 STUN binding-request/response codec — just enough to
//! ask a public STUN server "what's my server-reflexive address", scoped
//! down from a full TURN/STUN implementation since this daemon is a client
//! only (conceptually grounded on the binding-request/response split in
//! `mycrl/turn-rs`'s STUN codec, without the TURN allocation half).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

pub struct BindingRequest {
    pub transaction_id: [u8; 12],
}

impl BindingRequest {
    pub fn new(transaction_id: [u8; 12]) -> Self {
        Self { transaction_id }
    }

    pub fn encode(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        buf[2..4].copy_from_slice(&0u16.to_be_bytes()); // message length, no attributes
        buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&self.transaction_id);
        buf
    }
}

#[derive(Debug)]
pub enum StunError {
    TooShort,
    NotAResponse,
    TransactionMismatch,
    MissingXorMappedAddress,
    Io,
    Timeout,
}

/// One binding-request/response round trip against `server`, timing out
/// after 2s. Returns the server-reflexive address the STUN server observed.
pub async fn query(server: SocketAddr) -> Result<SocketAddr, StunError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|_| StunError::Io)?;
    let transaction_id: [u8; 12] = rand::random();
    let request = BindingRequest::new(transaction_id);
    socket
        .send_to(&request.encode(), server)
        .await
        .map_err(|_| StunError::Io)?;

    let mut buf = [0u8; 512];
    let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .map_err(|_| StunError::Timeout)?
        .map_err(|_| StunError::Io)?;
    parse_binding_response(&buf[..len], &transaction_id)
}

/// Parses a binding-response datagram, returning the server-reflexive
/// address recovered from its XOR-MAPPED-ADDRESS attribute.
pub fn parse_binding_response(
    buf: &[u8],
    expected_transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if buf.len() < 20 {
        return Err(StunError::TooShort);
    }
    let message_type = u16::from_be_bytes([buf[0], buf[1]]);
    if message_type != BINDING_RESPONSE {
        return Err(StunError::NotAResponse);
    }
    let message_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if &buf[8..20] != expected_transaction_id {
        return Err(StunError::TransactionMismatch);
    }
    if buf.len() < 20 + message_len {
        return Err(StunError::TooShort);
    }

    let mut offset = 20;
    while offset + 4 <= 20 + message_len {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > buf.len() {
            break;
        }
        if attr_type == XOR_MAPPED_ADDRESS {
            return decode_xor_mapped_address(&buf[value_start..value_end]);
        }
        // Attributes are padded to 4-byte boundaries.
        offset = value_end + ((4 - (attr_len % 4)) % 4);
    }
    Err(StunError::MissingXorMappedAddress)
}

fn decode_xor_mapped_address(value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::MissingXorMappedAddress);
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);

    if family == 0x01 {
        let mut xaddr = [0u8; 4];
        xaddr.copy_from_slice(&value[4..8]);
        let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
        let addr_bytes: Vec<u8> = xaddr
            .iter()
            .zip(cookie_bytes.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let ip = Ipv4Addr::new(addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3]);
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    } else {
        Err(StunError::MissingXorMappedAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_binding_request_header() {
        let req = BindingRequest::new([1; 12]);
        let encoded = req.encode();
        assert_eq!(&encoded[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&encoded[4..8], &MAGIC_COOKIE.to_be_bytes());
    }

    #[test]
    fn round_trips_xor_mapped_address() {
        let txid = [7u8; 12];
        let ip = Ipv4Addr::new(203, 0, 113, 5);
        let port: u16 = 54321;

        let xport = port ^ ((MAGIC_COOKIE >> 16) as u16);
        let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
        let xaddr: Vec<u8> = ip
            .octets()
            .iter()
            .zip(cookie_bytes.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let mut attr = vec![0u8, 0x01];
        attr.extend_from_slice(&xport.to_be_bytes());
        attr.extend_from_slice(&xaddr);

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&(8u16 + 4).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&txid);
        msg.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&8u16.to_be_bytes());
        msg.extend_from_slice(&attr);

        let resolved = parse_binding_response(&msg, &txid).unwrap();
        assert_eq!(resolved, SocketAddr::new(IpAddr::V4(ip), port));
    }
}
