use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use crate::context::{CancelCause, Context};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

/// Registers SIGINT and SIGTERM handlers and returns the root context.
///
/// The listener lives for the rest of the process. A second signal exits
/// with [`ExitCode::ForcedShutdown`](crate::exit::ExitCode::ForcedShutdown).
#[cfg(unix)]
pub fn install() -> crate::Result<Context> {
    use tokio::signal::unix::{signal, SignalKind};
    use tokio_stream::wrappers::SignalStream;

    let interrupts = SignalStream::new(signal(SignalKind::interrupt())?)
        .map(|_| TerminationSignal::Interrupt);
    let terminations = SignalStream::new(signal(SignalKind::terminate())?)
        .map(|_| TerminationSignal::Terminate);

    let (root, _listener) = listen(interrupts.merge(terminations), || {
        crate::exit::abort(crate::exit::ExitCode::ForcedShutdown)
    });
    Ok(root)
}

/// Spawns a listener over an arbitrary stream of termination signals.
///
/// Returns the root context and the listener handle. `on_forced_exit` runs
/// when a second signal arrives; the listener stops after calling it or when
/// the stream ends.
pub fn listen<S, F>(signals: S, on_forced_exit: F) -> (Context, JoinHandle<()>)
where
    S: Stream<Item = TerminationSignal> + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let root = Context::new();
    let ctx = root.clone();

    let listener = tokio::spawn(async move {
        tokio::pin!(signals);

        let Some(first) = signals.next().await else {
            return;
        };
        info!(signal = ?first, "Liftbridge Operator is stopping");
        ctx.cancel(CancelCause::Shutdown);

        let Some(second) = signals.next().await else {
            return;
        };
        error!(signal = ?second, "Liftbridge Operator failed to shutdown gracefully");
        on_forced_exit();
    });

    (root, listener)
}
