//! Fakes for the server's collaborators: a scripted port, a counting process and
//! an in-memory console.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mc_daemon::conn::{ConnError, ServerConn};
use mc_daemon::event::ServerEvent;
use mc_daemon::protocol::gateway::RemoteConsole;
use mc_daemon::protocol::ProtocolError;
use mc_daemon::server::{Server, Settings};
use mc_daemon::supervisor::{ProcError, ServerProcess};

#[derive(Default)]
pub struct FakeConn {
    open: AtomicBool,
    clients: AtomicUsize,
    unreadable: AtomicBool,
}

impl FakeConn {
    /// While set, every read fails as if the socket table were inaccessible.
    pub fn set_unreadable(&self, unreadable: bool) {
        self.unreadable.store(unreadable, Ordering::SeqCst);
    }

    fn read<T>(&self, value: T) -> Result<T, ConnError> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(ConnError("permission denied".to_string()));
        }
        Ok(value)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_clients(&self, clients: usize) {
        self.clients.store(clients, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerConn for FakeConn {
    fn is_open(&self) -> Result<bool, ConnError> {
        self.read(self.open.load(Ordering::SeqCst))
    }

    fn client_count(&self) -> Result<usize, ConnError> {
        self.read(self.clients.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakeProcess {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub kills: AtomicUsize,
    pub fail_start: AtomicBool,
    running: AtomicBool,
}

#[async_trait]
impl ServerProcess for FakeProcess {
    async fn start(&self) -> Result<(), ProcError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProcError::Spawn {
                program: "fake".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProcError::AlreadyRunning(None));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<(), ProcError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ProcError::NotRunning);
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct FakeConsole {
    pub received: Mutex<Vec<String>>,
}

impl RemoteConsole for FakeConsole {
    fn run(&self, command: &str) -> Result<String, ProtocolError> {
        self.received.lock().unwrap().push(command.to_string());
        Ok(format!("done: {}", command))
    }
}

pub struct Harness {
    pub server: Arc<Server>,
    pub conn: Arc<FakeConn>,
    pub process: Arc<FakeProcess>,
    pub console: Arc<FakeConsole>,
    pub events: Arc<Mutex<Vec<(ServerEvent, Duration)>>>,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let conn = Arc::new(FakeConn::default());
        let process = Arc::new(FakeProcess::default());
        let console = Arc::new(FakeConsole::default());
        let server = Server::assemble(conn.clone(), process.clone(), console.clone(), settings).unwrap();

        // handlers added here run after the controller's reactions, so these
        // records are only used for timing; ordering comes from the history
        let started = tokio::time::Instant::now();
        let events = Arc::new(Mutex::new(Vec::new()));
        for event in ServerEvent::ALL {
            let events = events.clone();
            server.subscribe(event, move || {
                events.lock().unwrap().push((event, started.elapsed()));
                async { anyhow::Ok(()) }
            });
        }

        Self {
            server: Arc::new(server),
            conn,
            process,
            console,
            events,
        }
    }

    /// Emission order, as recorded by the event history.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.server
            .history()
            .recent(usize::MAX)
            .into_iter()
            .map(|r| r.event)
            .collect()
    }

    /// Offset of the first occurrence of `event`.
    pub fn first(&self, event: ServerEvent) -> Option<Duration> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, at)| *at)
    }

    /// Emissions of `event` so far. Unlike the history this is unbounded.
    pub fn count(&self, event: ServerEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == event)
            .count()
    }
}

pub fn settings(startup: u64, idle: Option<u64>, polling: u64) -> Settings {
    Settings {
        startup_timeout: Duration::from_secs(startup),
        idle_timeout: idle.map(Duration::from_secs),
        polling_interval: Duration::from_secs(polling),
        max_command_len: 64,
        banned_commands: vec!["op".to_string()],
    }
}
