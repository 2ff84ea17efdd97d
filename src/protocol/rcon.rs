use super::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// id + type + 4096 byte body + two NULs
pub const MAX_PACKET_SIZE: usize = 4 + 4 + 4096 + 2;
const MIN_PACKET_SIZE: usize = 4 + 4 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let size = 4 + 4 + self.body.len() + 2;
        if size > MAX_PACKET_SIZE {
            return Err(ProtocolError::Protocol(format!("Packet size too large: {}", size)));
        }

        let mut buf = Vec::with_capacity(4 + size);
        // writes into a Vec cannot fail
        let _ = buf.write_i32::<LittleEndian>(size as i32);
        let _ = buf.write_i32::<LittleEndian>(self.id);
        let _ = buf.write_i32::<LittleEndian>(self.kind);
        buf.extend_from_slice(self.body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        Ok(buf)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let size = reader
            .read_i32::<LittleEndian>()
            .map_err(|e| ProtocolError::from_io("Failed to read packet size", e))?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(s))
            .ok_or_else(|| ProtocolError::Protocol(format!("Invalid packet size: {}", size)))?;

        let mut packet = vec![0u8; size];
        reader
            .read_exact(&mut packet)
            .map_err(|e| ProtocolError::from_io("Failed to read packet data", e))?;

        let mut cursor = &packet[..8];
        let id = cursor
            .read_i32::<LittleEndian>()
            .map_err(|e| ProtocolError::from_io("Failed to parse request ID", e))?;
        let kind = cursor
            .read_i32::<LittleEndian>()
            .map_err(|e| ProtocolError::from_io("Failed to parse packet type", e))?;

        // body is NUL terminated, followed by one more NUL
        let body = &packet[8..size - 2];
        let body = match body.iter().position(|b| *b == 0) {
            Some(end) => &body[..end],
            None => body,
        };

        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

/// Source RCON client, as spoken by Minecraft's `enable-rcon`.
///
/// One client is one authenticated TCP session.
#[derive(Debug)]
pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
}

impl RconClient {
    /// Connects to `host:port` and authenticates with `password`.
    pub fn connect(host: &str, port: u16, password: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => ProtocolError::Timeout(format!("Connecting to {}: {}", addr, e)),
            _ => ProtocolError::Connection(format!("Failed to connect to {}: {}", addr, e)),
        })?;

        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| ProtocolError::Connection(format!("Failed to set read timeout: {}", e)))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| ProtocolError::Connection(format!("Failed to set write timeout: {}", e)))?;

        let mut client = Self { stream, next_id: 0 };
        client.authenticate(password)?;

        tracing::debug!("RCON client connected to {}", addr);
        Ok(client)
    }

    fn authenticate(&mut self, password: &str) -> Result<(), ProtocolError> {
        let id = self.send(SERVERDATA_AUTH, password)?;

        // some servers send an empty RESPONSE_VALUE ahead of the auth response
        loop {
            let response = Packet::read_from(&mut self.stream)?;
            if response.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if response.id == -1 {
                return Err(ProtocolError::Auth("invalid password".to_string()));
            }
            if response.id != id {
                return Err(ProtocolError::Protocol(format!(
                    "Unexpected auth response id: {} (expected {})",
                    response.id, id
                )));
            }
            return Ok(());
        }
    }

    /// Runs `command` and returns the server's response body.
    pub fn execute(&mut self, command: &str) -> Result<String, ProtocolError> {
        let id = self.send(SERVERDATA_EXECCOMMAND, command)?;

        let response = Packet::read_from(&mut self.stream)?;
        if response.kind != SERVERDATA_RESPONSE_VALUE || response.id != id {
            return Err(ProtocolError::Protocol(format!(
                "Unexpected response (id {}, type {})",
                response.id, response.kind
            )));
        }
        Ok(response.body)
    }

    fn send(&mut self, kind: i32, body: &str) -> Result<i32, ProtocolError> {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let packet = Packet {
            id: self.next_id,
            kind,
            body: body.to_string(),
        }
        .encode()?;

        self.stream
            .write_all(&packet)
            .map_err(|e| ProtocolError::from_io("Failed to send packet", e))?;
        Ok(self.next_id)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProtocolError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProtocolError::Connection(format!("Failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| ProtocolError::Connection(format!("No address for {}:{}", host, port)))
}
