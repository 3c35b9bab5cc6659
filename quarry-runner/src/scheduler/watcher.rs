//! Queue watcher
//!
//! Periodically rediscovers subscriptions, keeps one `SubscriptionWorker`
//! running per subscription, and retires workers whose subscription has been
//! deleted. Device telemetry is logged on every cycle.

use anyhow::Result;
use quarry_core::MessageHandler;
use quarry_devices::DeviceReporter;
use quarry_queue::TaskQueue;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::scheduler::worker::SubscriptionWorker;

/// Workers currently running, keyed by subscription
#[derive(Default)]
struct Workers {
    tokens: HashMap<String, (task::Id, CancellationToken)>,
    names: HashMap<task::Id, String>,
    tasks: JoinSet<()>,
}

impl Workers {
    fn names(&self) -> BTreeSet<String> {
        self.tokens.keys().cloned().collect()
    }

    fn spawn<F>(&mut self, subscription: &str, token: CancellationToken, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.tasks.spawn(worker).id();
        self.names.insert(id, subscription.to_string());
        self.tokens.insert(subscription.to_string(), (id, token));
    }

    fn stop(&mut self, subscription: &str) {
        if let Some((_, token)) = self.tokens.remove(subscription) {
            token.cancel();
        }
    }

    /// Forgets a worker that has exited, so the next refresh can start it again
    fn reap(&mut self, joined: std::result::Result<(task::Id, ()), JoinError>) {
        let id = match &joined {
            Ok((id, ())) => *id,
            Err(e) => e.id(),
        };
        let Some(subscription) = self.names.remove(&id) else {
            return;
        };

        match joined {
            Ok(_) => debug!(subscription = %subscription, "Worker exited"),
            Err(e) if e.is_panic() => {
                error!(subscription = %subscription, error = %e, "Worker task panicked, restarting on next refresh")
            }
            Err(e) => warn!(subscription = %subscription, error = %e, "Worker task aborted"),
        }

        // A replacement may already be running under the same name
        if self.tokens.get(&subscription).is_some_and(|(current, _)| *current == id) {
            self.tokens.remove(&subscription);
        }
    }

    async fn shutdown(mut self) {
        for (_, token) in self.tokens.values() {
            token.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

/// Discovers subscriptions and supervises their workers
pub struct QueueWatcher {
    config: Config,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn MessageHandler>,
    devices: &'static DeviceReporter,
    matcher: Option<Regex>,
    mismatcher: Option<Regex>,
}

impl QueueWatcher {
    pub fn new(
        config: Config,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn MessageHandler>,
        devices: &'static DeviceReporter,
    ) -> Result<Self> {
        let (matcher, mismatcher) = config.matchers()?;
        Ok(Self {
            config,
            queue,
            handler,
            devices,
            matcher,
            mismatcher,
        })
    }

    /// Runs discovery cycles until `ctx` is cancelled, then joins every worker
    pub async fn run(&self, ctx: CancellationToken) {
        info!(
            queue_type = %self.queue.queue_type(),
            project = %self.config.project,
            interval = ?self.config.refresh_interval,
            "Starting queue watcher"
        );

        let mut workers = Workers::default();
        let mut ticker = time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                Some(joined) = workers.tasks.join_next_with_id(), if !workers.tasks.is_empty() => {
                    workers.reap(joined);
                }
                _ = ticker.tick() => {
                    self.log_devices();
                    self.refresh_cycle(&ctx, &mut workers).await;
                }
            }
        }

        info!(workers = workers.tokens.len(), "Shutting down, waiting for workers");
        workers.shutdown().await;
        info!("All workers stopped");
    }

    async fn refresh_cycle(&self, ctx: &CancellationToken, workers: &mut Workers) {
        let known = match self
            .queue
            .refresh(ctx, self.matcher.as_ref(), self.mismatcher.as_ref())
            .await
        {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "Subscription refresh failed");
                return;
            }
        };

        for subscription in known.difference(&workers.names()) {
            self.start_worker(ctx, workers, subscription);
        }

        for subscription in workers.names().difference(&known) {
            match self.queue.exists(ctx, subscription).await {
                Ok(false) => {
                    info!(subscription = %subscription, "Subscription removed, stopping worker");
                    workers.stop(subscription);
                }
                Ok(true) => {
                    debug!(subscription = %subscription, "Subscription filtered out of refresh but still exists");
                }
                Err(e) => {
                    warn!(subscription = %subscription, error = %e, "Existence check failed, keeping worker");
                }
            }
        }
    }

    fn start_worker(&self, ctx: &CancellationToken, workers: &mut Workers, subscription: &str) {
        let token = ctx.child_token();
        let worker = SubscriptionWorker::new(
            Arc::clone(&self.queue),
            subscription.to_string(),
            self.config.project.clone(),
            self.config.credentials.clone(),
            Arc::clone(&self.handler),
            self.config.work_settings(),
        )
        .with_idle_delay(idle_delay(self.config.refresh_interval));

        workers.spawn(subscription, token.clone(), worker.run(token));
    }

    fn log_devices(&self) {
        if !self.devices.is_available() {
            return;
        }
        match self.devices.snapshot() {
            Ok(snapshot) => info!(
                devices = snapshot.len(),
                free_mem_mib = snapshot.free_memory(),
                "Device telemetry"
            ),
            Err(e) => warn!(error = %e, "Failed to read device telemetry"),
        }
    }
}

/// Idle workers poll for work a few times per discovery cycle
fn idle_delay(refresh_interval: Duration) -> Duration {
    (refresh_interval / 4).clamp(Duration::from_millis(20), Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{FnHandler, HandlerOutcome, QueueType};
    use quarry_devices::DeviceError;
    use quarry_queue::{MemoryBroker, MemoryQueue};

    fn degraded_devices() -> &'static DeviceReporter {
        Box::leak(Box::new(DeviceReporter::new(Err(DeviceError::Init {
            message: "no driver in tests".to_string(),
        }))))
    }

    fn watcher(broker: &MemoryBroker, config: Config) -> QueueWatcher {
        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryQueue::new("proj", broker.clone()));
        let handler: Arc<dyn MessageHandler> =
            Arc::new(FnHandler::new(|_ctx, _task| async { HandlerOutcome::ack(None) }));
        QueueWatcher::new(config, queue, handler, degraded_devices()).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::new("runner".to_string(), QueueType::Memory, "proj".to_string());
        config.refresh_interval = Duration::from_millis(50);
        config.work_timeout = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn test_refresh_starts_and_retires_workers() {
        let broker = MemoryBroker::new().with_poll_interval(Duration::from_millis(10));
        broker.create_subscription("train-a");
        broker.create_subscription("train-b");
        broker.create_subscription("eval");

        let mut config = config();
        config.include = Some("^train-".to_string());
        let watcher = watcher(&broker, config);
        let ctx = CancellationToken::new();
        let mut workers = Workers::default();

        watcher.refresh_cycle(&ctx, &mut workers).await;
        assert_eq!(
            workers.names().into_iter().collect::<Vec<_>>(),
            vec!["train-a", "train-b"]
        );

        broker.delete_subscription("train-b");
        watcher.refresh_cycle(&ctx, &mut workers).await;
        assert_eq!(workers.names().into_iter().collect::<Vec<_>>(), vec!["train-a"]);

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), workers.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_processes_new_subscriptions() {
        let broker = MemoryBroker::new().with_poll_interval(Duration::from_millis(10));
        let watcher = watcher(&broker, config());
        let ctx = CancellationToken::new();

        let running = {
            let ctx = ctx.clone();
            tokio::spawn(async move { watcher.run(ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(80)).await;
        broker.create_subscription("late");
        for i in 0..3 {
            broker.publish("late", format!("job-{}", i)).unwrap();
        }

        for _ in 0..100 {
            if broker.stats("late").map(|s| s.acked) == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.stats("late").unwrap().acked, 3);
    }

    #[tokio::test]
    async fn test_panicked_worker_is_restarted() {
        let broker = MemoryBroker::new().with_poll_interval(Duration::from_millis(10));
        broker.create_subscription("train");
        let watcher = watcher(&broker, config());
        let ctx = CancellationToken::new();
        let mut workers = Workers::default();

        workers.spawn("train", ctx.child_token(), async {
            panic!("worker crashed");
        });
        let joined = workers.tasks.join_next_with_id().await.unwrap();
        assert!(joined.as_ref().is_err_and(|e| e.is_panic()));
        workers.reap(joined);
        assert!(workers.names().is_empty());
        assert!(workers.names.is_empty());

        watcher.refresh_cycle(&ctx, &mut workers).await;
        assert_eq!(workers.names().into_iter().collect::<Vec<_>>(), vec!["train"]);
        assert_eq!(workers.tasks.len(), 1);

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), workers.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_exit_keeps_replacement() {
        let mut workers = Workers::default();
        let old = CancellationToken::new();
        workers.spawn("train", old.clone(), {
            let old = old.clone();
            async move { old.cancelled().await }
        });
        workers.stop("train");

        let replacement = CancellationToken::new();
        workers.spawn("train", replacement.clone(), {
            let replacement = replacement.clone();
            async move { replacement.cancelled().await }
        });

        let joined = workers.tasks.join_next_with_id().await.unwrap();
        workers.reap(joined);
        assert_eq!(workers.names().into_iter().collect::<Vec<_>>(), vec!["train"]);

        replacement.cancel();
        workers.shutdown().await;
    }

    #[test]
    fn test_idle_delay_bounds() {
        assert_eq!(idle_delay(Duration::from_millis(40)), Duration::from_millis(20));
        assert_eq!(idle_delay(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(idle_delay(Duration::from_secs(60)), Duration::from_secs(5));
    }
}
