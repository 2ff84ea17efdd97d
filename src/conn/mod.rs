//! Connection Monitor - observes the supervised server's TCP port
//!
//! Nothing is cached: every query re-reads the OS socket table, so two consecutive
//! calls may disagree while the server is binding or clients are coming and going.

use async_trait::async_trait;
use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};
use std::time::Duration;

use crate::wait::{Poller, TimeoutExpired};

/// The OS socket table could not be read, so the port state is unknown.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to read the TCP socket table: {0}")]
pub struct ConnError(pub String);

/// What the daemon can learn about the server by looking at its port.
///
/// Every query can fail. An unreadable socket table says nothing about the
/// server, so callers must not read it as "closed" or "empty".
#[async_trait]
pub trait ServerConn: Send + Sync {
    /// Whether the port is in a listening state on this host.
    fn is_open(&self) -> Result<bool, ConnError>;

    /// Whether no established connection targets the port.
    fn is_empty(&self) -> Result<bool, ConnError> {
        Ok(self.client_count()? == 0)
    }

    /// Number of established connections to the port.
    fn client_count(&self) -> Result<usize, ConnError>;

    /// Suspends until the port is listening, or fails once `timeout` is spent.
    /// A failed read counts as "not yet".
    async fn wait_open(&self, timeout: Option<Duration>) -> Result<(), TimeoutExpired> {
        Poller::wait(
            || match self.is_open() {
                Ok(open) => open,
                Err(e) => {
                    tracing::debug!("Port check failed while waiting: {}", e);
                    false
                }
            },
            timeout,
        )
        .await
    }
}

/// Reduced view of a TCP socket table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEntry {
    pub local_port: u16,
    pub state: PortState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Listen,
    Established,
    Other,
}

impl From<TcpState> for PortState {
    fn from(state: TcpState) -> Self {
        match state {
            TcpState::Listen => PortState::Listen,
            TcpState::Established => PortState::Established,
            _ => PortState::Other,
        }
    }
}

fn count_in_state(entries: &[PortEntry], port: u16, state: PortState) -> usize {
    entries
        .iter()
        .filter(|e| e.local_port == port && e.state == state)
        .count()
}

/// [`ServerConn`] backed by the host's TCP socket table (IPv4 and IPv6).
#[derive(Debug, Clone)]
pub struct SocketConn {
    port: u16,
}

impl SocketConn {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current TCP table.
    fn snapshot(&self) -> Result<Vec<PortEntry>, ConnError> {
        let flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let sockets = get_sockets_info(flags, ProtocolFlags::TCP).map_err(|e| {
            tracing::warn!(port = self.port, "Failed to read TCP socket table: {}", e);
            ConnError(e.to_string())
        })?;

        Ok(sockets
            .into_iter()
            .filter_map(|socket| match socket.protocol_socket_info {
                ProtocolSocketInfo::Tcp(tcp) => Some(PortEntry {
                    local_port: tcp.local_port,
                    state: tcp.state.into(),
                }),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl ServerConn for SocketConn {
    fn is_open(&self) -> Result<bool, ConnError> {
        Ok(count_in_state(&self.snapshot()?, self.port, PortState::Listen) > 0)
    }

    fn client_count(&self) -> Result<usize, ConnError> {
        Ok(count_in_state(&self.snapshot()?, self.port, PortState::Established))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(local_port: u16, state: PortState) -> PortEntry {
        PortEntry { local_port, state }
    }

    #[test]
    fn test_count_filters_port_and_state() {
        let table = vec![
            entry(25565, PortState::Listen),
            entry(25565, PortState::Established),
            entry(25565, PortState::Established),
            entry(25575, PortState::Established),
            entry(25565, PortState::Other),
            entry(8080, PortState::Listen),
        ];
        assert_eq!(count_in_state(&table, 25565, PortState::Listen), 1);
        assert_eq!(count_in_state(&table, 25565, PortState::Established), 2);
        assert_eq!(count_in_state(&table, 25575, PortState::Listen), 0);
        assert_eq!(count_in_state(&[], 25565, PortState::Established), 0);
    }

    #[test]
    fn test_tcp_state_mapping() {
        assert_eq!(PortState::from(TcpState::Listen), PortState::Listen);
        assert_eq!(PortState::from(TcpState::Established), PortState::Established);
        assert_eq!(PortState::from(TcpState::TimeWait), PortState::Other);
        assert_eq!(PortState::from(TcpState::CloseWait), PortState::Other);
    }

    struct Scripted {
        open_after: std::sync::atomic::AtomicU32,
        unreadable: bool,
    }

    #[async_trait]
    impl ServerConn for Scripted {
        fn is_open(&self) -> Result<bool, ConnError> {
            use std::sync::atomic::Ordering;
            let pending = self
                .open_after
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if pending && self.unreadable {
                return Err(ConnError("permission denied".to_string()));
            }
            Ok(!pending)
        }

        fn client_count(&self) -> Result<usize, ConnError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_wait_open_uses_poller() {
        let conn = Scripted {
            open_after: std::sync::atomic::AtomicU32::new(4),
            unreadable: false,
        };
        assert_eq!(conn.is_empty(), Ok(true));
        assert!(conn.wait_open(Some(Duration::from_secs(5))).await.is_ok());

        let never = Scripted {
            open_after: std::sync::atomic::AtomicU32::new(u32::MAX),
            unreadable: false,
        };
        assert_eq!(
            never.wait_open(Some(Duration::from_secs(1))).await,
            Err(TimeoutExpired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_open_keeps_polling_through_read_failures() {
        let conn = Scripted {
            open_after: std::sync::atomic::AtomicU32::new(3),
            unreadable: true,
        };
        assert!(conn.is_open().is_err());
        assert!(conn.wait_open(Some(Duration::from_secs(5))).await.is_ok());
        assert_eq!(conn.is_open(), Ok(true));
    }
}
