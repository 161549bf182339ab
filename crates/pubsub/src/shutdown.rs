use crate::broker::Broker;
use crate::connection::Connection;
use crate::error::Result;
use crate::handler::in_observer_dispatch;

use std::fmt;
use std::panic::PanicHookInfo;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_panic::panic_hook;

/// Exit code recorded for an uncaught fault when none is configured.
pub const DEFAULT_FAULT_EXIT_CODE: i32 = 2;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Process-level hooks installed by
/// [`Connection::register_shutdown_hooks`].
///
/// On interrupt, terminate and user signals, or on an uncaught panic, the
/// connection is closed and its cancellation scope signalled. If the broker
/// closes the connection on its own the process exits with code 0.
///
/// The panic hook that was installed before registration is restored once
/// [`wait`](Self::wait) or [`exit`](Self::exit) returns.
pub struct ShutdownHooks<B>
where
    B: Broker,
{
    connection: Connection<B>,
    exit_code: Arc<AtomicI32>,
    previous_hook: PanicHook,
    task: JoinHandle<()>,
}

impl<B> fmt::Debug for ShutdownHooks<B>
where
    B: Broker,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("exit_code", &self.exit_code())
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl<B> ShutdownHooks<B>
where
    B: Broker,
{
    /// Exit code the process should terminate with: 0 unless an uncaught
    /// fault was observed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Waits for a signal or fault to trigger shutdown, then returns the exit
    /// code.
    pub async fn wait(self) -> i32 {
        if let Err(e) = self.task.await {
            warn!(error = %e, "shutdown hook task failed");
        }
        std::panic::set_hook(self.previous_hook);

        self.exit_code.load(Ordering::SeqCst)
    }

    /// Runs the shutdown sequence now, without waiting for a trigger.
    pub async fn exit(self) -> i32 {
        self.task.abort();
        std::panic::set_hook(self.previous_hook);

        self.connection.close_quietly().await;
        self.connection.cancel();

        self.exit_code.load(Ordering::SeqCst)
    }
}

impl<B> Connection<B>
where
    B: Broker,
{
    /// Installs shutdown hooks for this connection.
    ///
    /// `exit_code` is what [`ShutdownHooks::wait`] returns after an uncaught
    /// panic; it defaults to [`DEFAULT_FAULT_EXIT_CODE`]. Replaces the
    /// process panic hook with one that logs through `tracing`. Panics raised
    /// by message observers are caught by the consumer and reported on its
    /// error channel, so they do not count as uncaught.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signal`](crate::Error::Signal) if a signal handler
    /// cannot be installed.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn register_shutdown_hooks(&self, exit_code: Option<i32>) -> Result<ShutdownHooks<B>> {
        let fault_exit_code = exit_code.unwrap_or(DEFAULT_FAULT_EXIT_CODE);
        let recorded = Arc::new(AtomicI32::new(0));
        let fault = Arc::new(Notify::new());

        let mut signals = Signals::new()?;

        let previous_hook = std::panic::take_hook();
        {
            let recorded = recorded.clone();
            let fault = fault.clone();
            std::panic::set_hook(Box::new(move |panic_info| {
                if in_observer_dispatch() {
                    return;
                }

                panic_hook(panic_info);
                recorded.store(fault_exit_code, Ordering::SeqCst);
                fault.notify_one();
            }));
        }

        let connection = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = connection.terminated() => {
                    info!("broker closed the connection, exiting");
                    std::process::exit(0);
                }
                signal = signals.recv() => {
                    info!(signal, "received signal, shutting down");
                }
                () = fault.notified() => {
                    error!(exit_code = fault_exit_code, "uncaught fault, shutting down");
                }
            }

            connection.close_quietly().await;
            connection.cancel();
        });

        Ok(ShutdownHooks {
            connection: self.clone(),
            exit_code: recorded,
            previous_hook,
            task,
        })
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    user_defined1: tokio::signal::unix::Signal,
    user_defined2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use crate::error::Error;
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(Error::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(Error::Signal)?,
            user_defined1: signal(SignalKind::user_defined1()).map_err(Error::Signal)?,
            user_defined2: signal(SignalKind::user_defined2()).map_err(Error::Signal)?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.user_defined1.recv() => "SIGUSR1",
            _ = self.user_defined2.recv() => "SIGUSR2",
        }
    }
}

// Fall back to just ctrl-c on non-unix platforms
#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    #[allow(clippy::unnecessary_wraps)]
    const fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
