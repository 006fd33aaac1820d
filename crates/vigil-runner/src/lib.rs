//! Concurrent process runner with graceful shutdown.
//!
//! Long-running processes are spawned together and share a cancellation
//! token. On SIGINT/SIGTERM (or the first process failure) the token fires,
//! processes get a bounded grace period to drain, then closers run. The
//! process exits 0 on a clean stop and 1 when a process failed.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Process = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;
type Closer = Box<dyn FnOnce() -> ProcessFuture + Send>;

pub struct Runner {
    processes: Vec<(String, Process)>,
    closers: Vec<Closer>,
    grace_period: Duration,
    token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            grace_period: Duration::from_secs(10),
            token: CancellationToken::new(),
        }
    }

    /// Add a named long-running process. Processes must watch the token and
    /// return once it fires.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Add a cleanup step, executed after every process has stopped.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    /// How long processes and closers get to finish after cancellation.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Run until every process stops, then exit the process.
    pub async fn run(self) -> ! {
        let failed = self.run_inner().await;
        if failed {
            error!("application exiting with error");
            std::process::exit(1);
        }
        info!("application exiting normally");
        std::process::exit(0);
    }

    /// Same as [`run`] but returns instead of exiting, for tests.
    pub async fn run_inner(self) -> bool {
        let token = self.token;
        let grace_period = self.grace_period;
        let mut join_set: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        spawn_signal_handlers(token.clone());

        // Wait for processes; the first failure cancels the rest.
        let mut failed = false;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process stopped");
                }
                Ok((name, Err(e))) => {
                    error!(process = %name, error = %format!("{:#}", e), "process failed");
                    failed = true;
                    token.cancel();
                }
                Err(e) => {
                    error!(error = %e, "process panicked");
                    failed = true;
                    token.cancel();
                }
            }

            // After cancellation, give the remaining processes the grace
            // period to drain, then abort whatever is left.
            if token.is_cancelled() && !join_set.is_empty() {
                let drained = tokio::time::timeout(grace_period, async {
                    while let Some(result) = join_set.join_next().await {
                        match result {
                            Ok((name, Ok(()))) => debug!(process = %name, "process stopped"),
                            Ok((name, Err(e))) => {
                                error!(process = %name, error = %e, "process failed during drain");
                                failed = true;
                            }
                            Err(e) => {
                                error!(error = %e, "process panicked during drain");
                                failed = true;
                            }
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    error!(grace_period = ?grace_period, "grace period expired, aborting processes");
                    join_set.shutdown().await;
                }
                break;
            }
        }

        if !self.closers.is_empty() {
            info!(timeout = ?grace_period, "running closers");
            let result =
                tokio::time::timeout(grace_period, run_closers(self.closers)).await;
            if result.is_err() {
                error!("closers timed out");
            }
        }

        failed
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(e) => error!(error = %e, "error setting up signal handler"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(e) => error!(error = %e, "error setting up SIGTERM handler"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }
    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => debug!("closer completed"),
            Ok(Err(e)) => error!(error = %format!("{:#}", e), "closer failed"),
            Err(e) => error!(error = %e, "closer panicked"),
        }
    }
}
