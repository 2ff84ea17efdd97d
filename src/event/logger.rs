use super::{EventBus, ServerEvent};

fn describe(event: ServerEvent) -> &'static str {
    match event {
        ServerEvent::Opening => "Server is starting up",
        ServerEvent::Opened => "Server is open and accepting connections",
        ServerEvent::Closing => "Server is shutting down",
        ServerEvent::Closed => "Server is closed",
        ServerEvent::Crashed => "Server port closed unexpectedly, the server crashed",
        ServerEvent::Hung => "Server did not open its port within the startup timeout",
        ServerEvent::Occupied => "A player joined the empty server",
        ServerEvent::Empty => "The last player left the server",
        ServerEvent::Idle => "Server has been empty for longer than the idle timeout",
    }
}

fn log(event: ServerEvent) {
    let message = describe(event);
    match event {
        ServerEvent::Hung => tracing::error!(%event, "{}", message),
        ServerEvent::Crashed | ServerEvent::Empty | ServerEvent::Idle => {
            tracing::warn!(%event, "{}", message)
        }
        _ => tracing::info!(%event, "{}", message),
    }
}

/// Logs every lifecycle event emitted on `bus`.
pub fn attach(bus: &EventBus) {
    for event in ServerEvent::ALL {
        bus.subscribe(event, move || {
            log(event);
            async { anyhow::Ok(()) }
        });
    }
}
