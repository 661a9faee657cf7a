//! Runs the pipeline's long-lived workers side by side and shuts them down together.
//!
//! Every app process receives a shared [`CancellationToken`]. The token fires on
//! SIGINT/SIGTERM, or as soon as one process fails; closers run afterwards under a
//! timeout whatever the outcome.
//!
//! ```no_run
//! use pipeline_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process("heartbeat", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::time::sleep(Duration::from_secs(1)).await;
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedTask + Send>;

pub type Closer = Box<dyn FnOnce() -> BoxedTask + Send>;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Name of the first process that failed, if any.
    pub failed_process: Option<String>,
    pub closers_timed_out: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.failed_process.is_some() {
            1
        } else {
            0
        }
    }
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    /// Add a named process. A process that returns `Ok` simply finishes; one
    /// that returns `Err` cancels all the others.
    pub fn with_app_process<F, Fut>(mut self, name: &str, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes
            .push((name.to_string(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Leave SIGINT/SIGTERM alone; only the cancellation token stops the run.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run to completion and exit the process with the outcome's exit code.
    pub async fn run(self) {
        let outcome = self.run_until_complete().await;
        match &outcome.failed_process {
            Some(name) => error!(process = %name, "Application exiting with error"),
            None => info!("Application exiting normally"),
        }
        std::process::exit(outcome.exit_code());
    }

    pub async fn run_until_complete(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                let result = process(process_token).await;
                (name, result)
            });
        }

        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut failed_process = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(process = %name, "App process finished"),
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        error!(process = %name, error = format!("{:#}", err), "App process failed");
                        failed_process = Some(name);
                        token.cancel();
                    } else {
                        debug!(process = %name, error = %err, "App process failed during shutdown");
                    }
                }
                Err(err) => {
                    error!(error = %err, "App process panicked");
                    if !token.is_cancelled() {
                        failed_process = Some("<panicked>".to_string());
                        token.cancel();
                    }
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        // Cooperative shutdown first, then abort whatever is still running.
        let drained = tokio::time::timeout(self.closer_timeout, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            join_set.shutdown().await;
        }

        let mut closers_timed_out = false;
        if !self.closers.is_empty() {
            info!(timeout = ?self.closer_timeout, "Running closers");
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => info!("All closers completed"),
                Err(_) => {
                    error!(timeout = ?self.closer_timeout, "Closers timed out");
                    closers_timed_out = true;
                }
            }
        }

        RunOutcome {
            failed_process,
            closers_timed_out,
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "Error setting up SIGINT handler"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "Error setting up SIGTERM handler"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => debug!("Closer completed"),
            Ok(Err(err)) => error!(error = format!("{:#}", err), "Closer failed"),
            Err(err) => error!(error = %err, "Closer panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_finished_processes_exit_cleanly_and_run_closers() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process("once", |_ctx| async move { Ok(()) })
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .run_until_complete()
            .await;

        assert_eq!(outcome.exit_code(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings() {
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let flag = sibling_stopped.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process("looping", move |ctx| async move {
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_app_process("broken", |_ctx| async move {
                Err(anyhow::anyhow!("topic missing"))
            })
            .run_until_complete()
            .await;

        assert_eq!(outcome.failed_process.as_deref(), Some("broken"));
        assert_eq!(outcome.exit_code(), 1);
        assert!(sibling_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_run() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_cancellation_token(token)
            .with_app_process("listener", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .run_until_complete()
            .await;

        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_closer_times_out() {
        let outcome = Runner::new()
            .without_signal_handlers()
            .with_closer_timeout(Duration::from_secs(1))
            .with_closer(|| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .run_until_complete()
            .await;

        assert!(outcome.closers_timed_out);
        assert_eq!(outcome.exit_code(), 0);
    }
}
