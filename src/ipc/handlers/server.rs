use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use super::super::{
    ActionResponse, CommandRequest, CommandResponse, EventsQuery, EventsResponse, IPCServer,
    StatusResponse,
};

const DEFAULT_EVENT_LIMIT: usize = 100;

/// GET /api/server/status - 상태, 접속자 수, 유휴 종료까지 남은 시간
pub async fn get_status(State(state): State<IPCServer>) -> impl IntoResponse {
    let server = &state.server;
    let client_count = match server.client_count() {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!("Client count unavailable: {}", e);
            None
        }
    };
    Json(StatusResponse {
        status: server.status(),
        client_count,
        idle_timeout_in: server.timeout_in().map(|d| d.as_secs_f64()),
    })
}

/// POST /api/server/open
pub async fn open_server(State(state): State<IPCServer>) -> impl IntoResponse {
    let success = state.server.try_open().await;
    Json(ActionResponse {
        success,
        status: state.server.status(),
    })
}

/// POST /api/server/close
pub async fn close_server(State(state): State<IPCServer>) -> impl IntoResponse {
    let success = state.server.try_close().await;
    Json(ActionResponse {
        success,
        status: state.server.status(),
    })
}

/// POST /api/server/restart
pub async fn restart_server(State(state): State<IPCServer>) -> impl IntoResponse {
    let success = state.server.try_restart().await;
    Json(ActionResponse {
        success,
        status: state.server.status(),
    })
}

/// POST /api/server/command - RCON 명령어 실행 (서버가 열려 있을 때만)
pub async fn execute_command(
    State(state): State<IPCServer>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    match state.server.execute(&req.command).await {
        Ok(response) => Json(CommandResponse {
            success: true,
            response,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(command = %req.command, "Command rejected: {}", e);
            e.into_response()
        }
    }
}

/// GET /api/server/events?since=<id> - 이벤트 기록 폴링
pub async fn list_events(
    State(state): State<IPCServer>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let history = state.server.history();
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events = match query.since {
        Some(since) => {
            let mut events = history.get_since(since);
            events.truncate(limit);
            events
        }
        None => history.recent(limit),
    };
    Json(EventsResponse { events })
}
