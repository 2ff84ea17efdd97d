use sysinfo::{Pid, ProcessStatus, System};

/// What the OS process table says about a PID the supervisor gave up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Gone,
    Zombie,
    Listed,
}

/// 특정 PID 상태 확인 (크로스 플랫폼)
pub fn pid_state(pid: u32) -> PidState {
    let mut sys = System::new();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        None => PidState::Gone,
        Some(process) if process.status() == ProcessStatus::Zombie => PidState::Zombie,
        Some(_) => PidState::Listed,
    }
}

// sysinfo scans the whole process table synchronously; keep it off the runtime workers.
pub async fn pid_state_async(pid: u32) -> PidState {
    tokio::task::spawn_blocking(move || pid_state(pid))
        .await
        .unwrap_or(PidState::Listed)
}
