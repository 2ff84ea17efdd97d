//! Idle/Health Monitor - polls the server's port while it is open
//!
//! Started on `Opened`, cancelled on `Closing`. Each tick runs a crash check
//! (port no longer listening → `Crashed`) and, when an idle timeout is configured,
//! an idle check that emits `Empty` / `Occupied` / `Idle`. A tick whose socket
//! table read fails reports nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::conn::ServerConn;
use crate::event::{EventBus, ServerEvent};
use crate::supervisor::ServerStatus;

type IdleSince = Arc<Mutex<Option<Instant>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State owned by one activation of the polling loop.
struct Run {
    token: CancellationToken,
    idle_since: IdleSince,
}

pub struct ServerMonitor {
    conn: Arc<dyn ServerConn>,
    bus: Arc<EventBus>,
    status: watch::Receiver<ServerStatus>,
    idle_timeout: Option<Duration>,
    polling_intv: Duration,
    run: Mutex<Option<Run>>,
}

impl ServerMonitor {
    /// `idle_timeout = None` disables the idle check; the crash check always runs.
    /// `status` is the controller's published status; the loop only starts while it is `Open`.
    pub fn new(
        conn: Arc<dyn ServerConn>,
        bus: Arc<EventBus>,
        status: watch::Receiver<ServerStatus>,
        idle_timeout: Option<Duration>,
        polling_intv: Duration,
    ) -> Result<Arc<Self>, ConfigError> {
        if polling_intv.is_zero() {
            return Err(ConfigError::Invalid(
                "Polling interval must be greater than zero".to_string(),
            ));
        }
        if idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "Idle timeout must be greater than zero".to_string(),
            ));
        }

        let monitor = Arc::new(Self {
            conn,
            bus: bus.clone(),
            status,
            idle_timeout,
            polling_intv,
            run: Mutex::new(None),
        });

        let weak = Arc::downgrade(&monitor);
        bus.subscribe(ServerEvent::Opened, move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.start();
            }
            async { anyhow::Ok(()) }
        });
        let weak = Arc::downgrade(&monitor);
        bus.subscribe(ServerEvent::Closing, move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.stop();
            }
            async { anyhow::Ok(()) }
        });

        Ok(monitor)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run).is_some()
    }

    /// Remaining idle budget, or `None` while occupied, stopped, or unconfigured.
    pub fn timeout_in(&self) -> Option<Duration> {
        let timeout = self.idle_timeout?;
        let run = lock(&self.run);
        let since = (*lock(&run.as_ref()?.idle_since))?;
        Some(timeout.saturating_sub(since.elapsed()))
    }

    /// Spawns a fresh polling loop, replacing any previous one.
    ///
    /// Does nothing unless the server is `Open`: an `Opened` dispatch can still be
    /// running after another task has begun closing the server.
    pub fn start(self: &Arc<Self>) {
        let run = Run {
            token: CancellationToken::new(),
            idle_since: Arc::new(Mutex::new(None)),
        };
        let token = run.token.clone();
        let idle_since = run.idle_since.clone();

        {
            // checked under the run lock, so a concurrent `stop` either sees this run or
            // the status has already left `Open`
            let mut slot = lock(&self.run);
            let status = *self.status.borrow();
            if status != ServerStatus::Open {
                tracing::debug!(%status, "Server is not open, monitor not started");
                return;
            }
            if let Some(previous) = slot.replace(run) {
                previous.token.cancel();
            }
        }

        tracing::info!(interval = ?self.polling_intv, idle_timeout = ?self.idle_timeout, "Server monitor started");
        let this = self.clone();
        tokio::spawn(async move { this.run_loop(token, idle_since).await });
    }

    /// Cancels the polling loop. The loop observes this at its next sleep.
    pub fn stop(&self) {
        if let Some(run) = lock(&self.run).take() {
            run.token.cancel();
            *lock(&run.idle_since) = None;
            tracing::info!("Server monitor stopped");
        }
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken, idle_since: IdleSince) {
        loop {
            if token.is_cancelled() {
                break;
            }

            self.tick(&token, &idle_since).await;

            let sleep = time::sleep(self.polling_intv);
            tokio::pin!(sleep);
            select! {
                _ = &mut sleep => {}
                _ = token.cancelled() => { break; }
            }
        }

        *lock(&idle_since) = None;
        tracing::debug!("Server monitor loop exited");
    }

    async fn tick(&self, token: &CancellationToken, idle_since: &IdleSince) {
        match self.conn.is_open() {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Server port is no longer listening");
                self.publish(ServerEvent::Crashed).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Skipping health check: {}", e);
                return;
            }
        }

        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };
        if token.is_cancelled() {
            return;
        }

        let empty = match self.conn.is_empty() {
            Ok(empty) => empty,
            Err(e) => {
                tracing::warn!("Skipping idle check: {}", e);
                return;
            }
        };
        let since = *lock(idle_since);
        match (empty, since) {
            (false, Some(_)) => {
                *lock(idle_since) = None;
                self.publish(ServerEvent::Occupied).await;
            }
            (true, None) => {
                *lock(idle_since) = Some(Instant::now());
                self.publish(ServerEvent::Empty).await;
            }
            (true, Some(since)) if since.elapsed() >= idle_timeout => {
                self.publish(ServerEvent::Idle).await;
            }
            _ => {}
        }
    }

    async fn publish(&self, event: ServerEvent) {
        if let Err(e) = self.bus.emit(event).await {
            tracing::error!(%event, "Failed to emit event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Port {
        open: AtomicBool,
        clients: AtomicUsize,
        /// upcoming `is_open` / `client_count` reads that fail
        open_failures: AtomicUsize,
        count_failures: AtomicUsize,
    }

    fn read<T>(failures: &AtomicUsize, value: T) -> Result<T, ConnError> {
        match failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(ConnError("socket table unavailable".to_string())),
            Err(_) => Ok(value),
        }
    }

    #[async_trait]
    impl ServerConn for Port {
        fn is_open(&self) -> Result<bool, ConnError> {
            read(&self.open_failures, self.open.load(Ordering::SeqCst))
        }

        fn client_count(&self) -> Result<usize, ConnError> {
            read(&self.count_failures, self.clients.load(Ordering::SeqCst))
        }
    }

    type Events = Arc<Mutex<Vec<(ServerEvent, Duration)>>>;

    struct Setup {
        monitor: Arc<ServerMonitor>,
        port: Arc<Port>,
        bus: Arc<EventBus>,
        status: watch::Sender<ServerStatus>,
        events: Events,
    }

    fn record(bus: &EventBus, started: Instant) -> Events {
        let seen: Events = Arc::new(Mutex::new(Vec::new()));
        for event in [ServerEvent::Crashed, ServerEvent::Occupied, ServerEvent::Empty, ServerEvent::Idle] {
            let seen = seen.clone();
            bus.subscribe(event, move || {
                seen.lock().unwrap().push((event, started.elapsed()));
                async { anyhow::Ok(()) }
            });
        }
        seen
    }

    fn names(events: &Events) -> Vec<ServerEvent> {
        events.lock().unwrap().iter().map(|(e, _)| *e).collect()
    }

    fn port() -> Arc<Port> {
        Arc::new(Port {
            open: AtomicBool::new(true),
            clients: AtomicUsize::new(0),
            open_failures: AtomicUsize::new(0),
            count_failures: AtomicUsize::new(0),
        })
    }

    fn setup(idle: Option<Duration>) -> Setup {
        let bus = Arc::new(EventBus::new());
        let events = record(&bus, Instant::now());
        let port = port();
        let (status, rx) = watch::channel(ServerStatus::Open);
        let monitor =
            ServerMonitor::new(port.clone(), bus.clone(), rx, idle, Duration::from_secs(1)).unwrap();
        Setup {
            monitor,
            port,
            bus,
            status,
            events,
        }
    }

    #[test]
    fn test_rejects_zero_durations() {
        let bus = Arc::new(EventBus::new());
        let port: Arc<dyn ServerConn> = port();
        let (_status, rx) = watch::channel(ServerStatus::Open);
        assert!(ServerMonitor::new(port.clone(), bus.clone(), rx.clone(), None, Duration::ZERO).is_err());
        assert!(ServerMonitor::new(port, bus, rx, Some(Duration::ZERO), Duration::from_secs(1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_follows_opened_and_closing() {
        let Setup { monitor, bus, .. } = setup(Some(Duration::from_secs(10)));
        assert!(!monitor.is_running());

        bus.emit(ServerEvent::Opened).await.unwrap();
        assert!(monitor.is_running());
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.timeout_in(), Some(Duration::from_millis(9_500)));

        bus.emit(ServerEvent::Closing).await.unwrap();
        assert!(!monitor.is_running());
        assert_eq!(monitor.timeout_in(), None);
    }

    /// `Opened` delivered after the server already left `Open` must not start polling.
    #[tokio::test(start_paused = true)]
    async fn test_stale_opened_does_not_start_loop() {
        let Setup {
            monitor,
            bus,
            status,
            events,
            ..
        } = setup(Some(Duration::from_secs(2)));
        status.send_replace(ServerStatus::Closed);

        bus.emit(ServerEvent::Opened).await.unwrap();
        assert!(!monitor.is_running());
        time::sleep(Duration::from_secs(5)).await;
        assert!(names(&events).is_empty());

        status.send_replace(ServerStatus::Open);
        bus.emit(ServerEvent::Opened).await.unwrap();
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_timeout() {
        let Setup {
            monitor: _monitor,
            bus,
            events,
            ..
        } = setup(Some(Duration::from_secs(10)));
        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(11_500)).await;

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen[0], (ServerEvent::Empty, Duration::ZERO));
        // the tick landing on the deadline counts
        assert_eq!(seen[1], (ServerEvent::Idle, Duration::from_secs(10)));
        assert_eq!(seen[2], (ServerEvent::Idle, Duration::from_secs(11)));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_repeats_until_stopped() {
        let Setup {
            monitor, bus, events, ..
        } = setup(Some(Duration::from_secs(2)));
        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(
            names(&events),
            vec![
                ServerEvent::Empty,
                ServerEvent::Idle,
                ServerEvent::Idle,
                ServerEvent::Idle,
                ServerEvent::Idle
            ]
        );

        monitor.stop();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(names(&events).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_resets_idle_clock() {
        let Setup {
            monitor,
            port,
            bus,
            events,
            ..
        } = setup(Some(Duration::from_secs(10)));
        bus.emit(ServerEvent::Opened).await.unwrap();

        time::sleep(Duration::from_millis(5_500)).await;
        port.clients.store(2, Ordering::SeqCst);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.timeout_in(), None);

        port.clients.store(0, Ordering::SeqCst);
        time::sleep(Duration::from_secs(11)).await;

        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ServerEvent::Empty, Duration::ZERO),
                (ServerEvent::Occupied, Duration::from_secs(6)),
                (ServerEvent::Empty, Duration::from_secs(7)),
                (ServerEvent::Idle, Duration::from_secs(17)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_closing_is_a_crash() {
        let Setup {
            monitor: _monitor,
            port,
            bus,
            events,
            ..
        } = setup(None);
        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(2_500)).await;
        // no idle timeout: nothing reported while the port is up
        assert!(names(&events).is_empty());

        port.open.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(names(&events), vec![ServerEvent::Crashed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_socket_table_skips_tick() {
        let Setup {
            monitor,
            port,
            bus,
            events,
            ..
        } = setup(Some(Duration::from_secs(10)));
        // tick at 0s cannot tell whether the port is up, tick at 1s cannot count clients
        port.open_failures.store(1, Ordering::SeqCst);
        port.count_failures.store(1, Ordering::SeqCst);

        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(1_500)).await;
        assert!(names(&events).is_empty());
        assert!(monitor.is_running());
        assert_eq!(monitor.timeout_in(), None);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            events.lock().unwrap().clone(),
            vec![(ServerEvent::Empty, Duration::from_secs(2))]
        );
        assert_eq!(monitor.timeout_in(), Some(Duration::from_millis(9_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_begins_from_clean_slate() {
        let Setup {
            monitor, bus, events, ..
        } = setup(Some(Duration::from_secs(10)));
        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(5_500)).await;
        bus.emit(ServerEvent::Closing).await.unwrap();

        bus.emit(ServerEvent::Opened).await.unwrap();
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.timeout_in(), Some(Duration::from_millis(9_500)));
        assert_eq!(names(&events), vec![ServerEvent::Empty, ServerEvent::Empty]);
    }
}
