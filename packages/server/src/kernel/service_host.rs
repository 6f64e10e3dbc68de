//! Long-running service supervision.
//!
//! Every background component (scheduler, worker runtime, rate sync) is a
//! [`Service`]: a named task that runs until its shutdown token fires. The
//! [`ServiceHost`] spawns them, waits for a shutdown signal, cancels the
//! shared token, and joins everything with a bounded grace period.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until completion or until `shutdown` is cancelled. Services are
    /// expected to drain in-flight work before returning.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
    join_grace: Duration,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
            join_grace: Duration::from_secs(90),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token shared with every hosted service; cancel it to stop the host.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn all services, then wait for either `signal` to resolve or every
    /// service to exit on its own. Afterwards, cancel the shutdown token and
    /// join the rest within the grace period.
    pub async fn run_until(self, signal: impl Future<Output = ()>) {
        let mut tasks = JoinSet::new();
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "starting service");
            tasks.spawn(async move {
                match service.run(token).await {
                    Ok(()) => info!(service = name, "service stopped"),
                    Err(e) => error!(service = name, error = %e, "service failed"),
                }
            });
        }

        tokio::select! {
            _ = signal => {
                info!("shutdown signal received");
            }
            _ = async {
                while tasks.join_next().await.is_some() {}
            } => {
                warn!("all services exited before shutdown signal");
            }
        }

        self.shutdown.cancel();
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.join_grace, drain).await.is_err() {
            warn!(
                grace_seconds = self.join_grace.as_secs(),
                "services did not drain within grace period, aborting"
            );
        }
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Recorder {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Service for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn services_observe_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(Recorder {
            stopped: stopped.clone(),
        });
        host.run_until(async {}).await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
