//! Process exit codes and the irrecoverable-condition exit path.

use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Graceful,
    StartupFailure,
    LeadershipLost,
    WorkloadExited,
    ForcedShutdown,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Graceful => 0,
            ExitCode::StartupFailure => 1,
            ExitCode::LeadershipLost => 2,
            ExitCode::WorkloadExited => 3,
            ExitCode::ForcedShutdown => 130,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Graceful)
    }
}

/// Terminates the process immediately without unwinding.
///
/// Only the entry point and the forced-shutdown path of the signal listener
/// call this; library code returns outcomes instead.
pub fn abort(code: ExitCode) -> ! {
    if code.is_success() {
        info!("Liftbridge Operator exited");
    } else {
        error!(code = code.code(), reason = ?code, "Liftbridge Operator is exiting on an irrecoverable condition");
    }
    std::process::exit(code.code())
}
