//! Directory backed queues
//!
//! Layout under the root directory:
//! - every non-hidden subdirectory is a subscription, except `<name>_response`
//!   directories, which receive the reports for subscription `<name>`
//! - every non-hidden regular file inside it is one message
//! - `<subscription>/.leased/` holds messages currently leased to a consumer
//!
//! Leasing is a rename, so competing consumers on the same directory never
//! both receive a message. A lease whose file has not been touched for longer
//! than the ack deadline is returned to the queue on the next pull.

use async_trait::async_trait;
use bytes::Bytes;
use quarry_core::{PayloadWrapper, QueueType, Report, TaskEnvelope, short_name};
use regex::Regex;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch;
use crate::error::{QueueError, Result};
use crate::queue::{TaskQueue, WorkOutcome, WorkSettings, matches_filters};
use crate::receive::{Delivery, MessageSource};
use crate::responder::{encode_report, spawn_forwarder};

const LEASE_DIR: &str = ".leased";

/// Separates a message name from the token of the lease holding it
const LEASE_SEPARATOR: char = '@';

/// Suffix of the sibling directory a subscription's reports are written to
pub const RESPONSE_SUFFIX: &str = "_response";

#[derive(Debug, Clone)]
pub struct FileQueueConfig {
    /// How long an empty pull waits before scanning again
    pub poll_interval: Duration,
}

impl Default for FileQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// `TaskQueue` over a directory tree
pub struct FileQueue {
    project: String,
    root: PathBuf,
    config: FileQueueConfig,
}

impl FileQueue {
    pub fn new(project: impl Into<String>, root: impl Into<PathBuf>, config: FileQueueConfig) -> Self {
        Self {
            project: project.into(),
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enqueues a message, returning the path it was written to
    ///
    /// The file is written under a hidden name first and renamed into place,
    /// so consumers never observe a partial message.
    pub async fn publish(&self, subscription: &str, data: &[u8]) -> Result<PathBuf> {
        let dir = self.subscription_dir(subscription)?;
        write_atomically(&dir, data).await
    }

    fn subscription_dir(&self, subscription: &str) -> Result<PathBuf> {
        let name = short_name(subscription);
        if name.is_empty() || name.starts_with('.') || name.contains('\\') {
            return Err(QueueError::discovery(
                "subscription",
                subscription,
                "not a valid subscription directory name",
            ));
        }
        if is_response_dir(name) {
            return Err(QueueError::discovery(
                "subscription",
                subscription,
                "directory is reserved for reports",
            ));
        }
        Ok(self.root.join(name))
    }
}

fn is_response_dir(name: &str) -> bool {
    name.ends_with(RESPONSE_SUFFIX)
}

/// `Ok(false)` when `path` is missing or not a directory
async fn is_directory(path: &Path) -> io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl TaskQueue for FileQueue {
    fn queue_type(&self) -> QueueType {
        QueueType::File
    }

    async fn refresh(
        &self,
        _ctx: &CancellationToken,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<BTreeSet<String>> {
        let root = self.root.display().to_string();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| QueueError::discovery("refresh", &root, e.to_string()))?;

        let mut known = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::discovery("refresh", &root, e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || is_response_dir(&name) {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| QueueError::discovery("refresh", &name, e.to_string()))?
                .is_dir();
            if is_dir && matches_filters(&name, matcher, mismatcher) {
                known.insert(name);
            }
        }
        Ok(known)
    }

    async fn exists(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        if is_response_dir(short_name(subscription)) {
            return Ok(false);
        }
        let dir = self.subscription_dir(subscription)?;
        is_directory(&dir)
            .await
            .map_err(|e| QueueError::discovery("exists", subscription, e.to_string()))
    }

    async fn has_work(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        let dir = self.subscription_dir(subscription)?;
        match list_messages(&dir).await {
            Ok(names) => Ok(!names.is_empty()),
            Err(QueueError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn work(
        &self,
        ctx: &CancellationToken,
        settings: &WorkSettings,
        task: &TaskEnvelope,
    ) -> Result<WorkOutcome> {
        let dir = self.subscription_dir(&task.subscription)?;
        if !self.exists(ctx, &task.subscription).await? {
            return Err(QueueError::discovery(
                "work",
                &task.subscription,
                "subscription directory does not exist",
            ));
        }

        let lease_dir = dir.join(LEASE_DIR);
        tokio::fs::create_dir_all(&lease_dir)
            .await
            .map_err(|e| QueueError::io("work", &lease_dir, e))?;

        debug!(project = %self.project, dir = %dir.display(), "Receiving from directory");

        let source = FileSource {
            dir,
            lease_dir,
            lease: settings.ack_deadline,
            poll_interval: self.config.poll_interval,
        };
        dispatch::work(&source, ctx, settings, task).await
    }

    async fn responder(
        &self,
        _ctx: &CancellationToken,
        subscription: &str,
        wrapper: Option<Arc<dyn PayloadWrapper>>,
    ) -> Result<mpsc::Sender<Report>> {
        self.subscription_dir(subscription)?;
        let target = format!("{}{}", short_name(subscription), RESPONSE_SUFFIX);
        let dir = self.root.join(&target);
        let found = is_directory(&dir)
            .await
            .map_err(|e| QueueError::discovery("responder", &target, e.to_string()))?;
        if !found {
            return Err(QueueError::discovery(
                "responder",
                &target,
                "response directory does not exist",
            ));
        }

        info!(dir = %dir.display(), "Opened file responder");
        Ok(spawn_forwarder(subscription.to_string(), move |report| {
            let dir = dir.clone();
            let wrapper = wrapper.clone();
            async move {
                let body = encode_report(&report, wrapper.as_deref())?;
                write_atomically(&dir, &body).await.map(|_| ())
            }
        }))
    }
}

/// Writes `data` to a new message file in `dir`
async fn write_atomically(dir: &Path, data: &[u8]) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = format!("{:020}-{}", nanos, Uuid::new_v4().simple());
    let staging = dir.join(format!(".{}.tmp", name));
    let target = dir.join(&name);

    tokio::fs::write(&staging, data)
        .await
        .map_err(|e| QueueError::io("publish", &staging, e))?;
    tokio::fs::rename(&staging, &target)
        .await
        .map_err(|e| QueueError::io("publish", &target, e))?;
    Ok(target)
}

/// Non-hidden regular files in `dir`, in name order
async fn list_messages(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| QueueError::io("list", dir, e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::io("list", dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => names.push(name),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(QueueError::io("list", entry.path(), e)),
        }
    }
    names.sort();
    Ok(names)
}

/// Sets a file's modification time to now, restarting its lease
async fn touch(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await
    .map_err(io::Error::other)?
}

struct FileSource {
    dir: PathBuf,
    lease_dir: PathBuf,
    lease: Duration,
    poll_interval: Duration,
}

impl FileSource {
    /// Returns expired leases to the queue
    async fn reclaim_expired(&self) -> Result<()> {
        for name in list_messages(&self.lease_dir).await? {
            let original = match name.rsplit_once(LEASE_SEPARATOR) {
                Some((original, _)) => original.to_string(),
                None => name.clone(),
            };
            let leased = self.lease_dir.join(&name);
            let modified = match tokio::fs::metadata(&leased).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(QueueError::io("reclaim", &leased, e)),
            };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age <= self.lease {
                continue;
            }

            match tokio::fs::rename(&leased, self.dir.join(&original)).await {
                Ok(()) => info!(message_id = %original, age = ?age, "Reclaimed expired lease"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(QueueError::io("reclaim", &leased, e)),
            }
        }
        Ok(())
    }

    async fn lease_batch(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        self.reclaim_expired().await?;

        let mut batch: Vec<Box<dyn Delivery>> = Vec::new();
        for name in list_messages(&self.dir).await? {
            if batch.len() >= max {
                break;
            }

            // Each lease gets its own file name so a holder whose lease was
            // reclaimed cannot settle the next holder's copy
            let leased = self.lease_dir.join(format!(
                "{}{}{}",
                name,
                LEASE_SEPARATOR,
                Uuid::new_v4().simple()
            ));
            match tokio::fs::rename(self.dir.join(&name), &leased).await {
                Ok(()) => {}
                // Another consumer won the race
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(QueueError::io("lease", &leased, e)),
            }
            touch(&leased)
                .await
                .map_err(|e| QueueError::io("lease", &leased, e))?;

            let data = tokio::fs::read(&leased)
                .await
                .map_err(|e| QueueError::io("read", &leased, e))?;

            batch.push(Box::new(FileDelivery {
                dir: self.dir.clone(),
                leased,
                name,
                data: Bytes::from(data),
            }));
        }
        Ok(batch)
    }
}

#[async_trait]
impl MessageSource for FileSource {
    async fn pull(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let batch = self.lease_batch(max).await?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        tokio::time::sleep(self.poll_interval).await;
        self.lease_batch(max).await
    }
}

struct FileDelivery {
    dir: PathBuf,
    leased: PathBuf,
    name: String,
    data: Bytes,
}

#[async_trait]
impl Delivery for FileDelivery {
    fn id(&self) -> &str {
        &self.name
    }

    fn data(&self) -> &Bytes {
        &self.data
    }

    async fn ack(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.leased).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(message_id = %self.name, "Lease was reclaimed before ack, message will be redelivered");
                Ok(())
            }
            Err(e) => Err(QueueError::io("ack", &self.leased, e)),
        }
    }

    async fn nack(&self) -> Result<()> {
        match tokio::fs::rename(&self.leased, self.dir.join(&self.name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io("nack", &self.leased, e)),
        }
    }

    async fn extend(&self, _lease: Duration) -> Result<()> {
        touch(&self.leased)
            .await
            .map_err(|e| QueueError::io("extend", &self.leased, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StopReason;
    use quarry_core::{FnHandler, HandlerOutcome, MessageHandler, ReportPayload};
    use tempfile::TempDir;

    fn queue_with(names: &[&str]) -> (TempDir, FileQueue) {
        let root = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        let queue = FileQueue::new(
            "local",
            root.path(),
            FileQueueConfig {
                poll_interval: Duration::from_millis(20),
            },
        );
        (root, queue)
    }

    fn source(queue: &FileQueue, subscription: &str, lease: Duration) -> FileSource {
        let dir = queue.root().join(subscription);
        let lease_dir = dir.join(LEASE_DIR);
        std::fs::create_dir_all(&lease_dir).unwrap();
        FileSource {
            dir,
            lease_dir,
            lease,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_refresh_lists_directories_only() {
        let (root, queue) = queue_with(&["train", "eval", ".hidden"]);
        std::fs::write(root.path().join("stray-file"), b"x").unwrap();
        let ctx = CancellationToken::new();

        let known = queue.refresh(&ctx, None, None).await.unwrap();
        assert_eq!(known.into_iter().collect::<Vec<_>>(), vec!["eval", "train"]);

        let include = Regex::new("^tr").unwrap();
        let known = queue.refresh(&ctx, Some(&include), None).await.unwrap();
        assert_eq!(known.len(), 1);
    }

    #[tokio::test]
    async fn test_report_directories_are_not_subscriptions() {
        let (root, queue) = queue_with(&["train", "train_response"]);
        let ctx = CancellationToken::new();

        let tx = queue.responder(&ctx, "train", None).await.unwrap();
        tx.send(Report::new(
            "runner",
            "train",
            ReportPayload::Progress {
                state: "finished".to_string(),
                message: "exit status 0".to_string(),
            },
        ))
        .await
        .unwrap();
        let response_dir = root.path().join("train_response");
        for _ in 0..50 {
            if !list_messages(&response_dir).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let known = queue.refresh(&ctx, None, None).await.unwrap();
        assert_eq!(known.into_iter().collect::<Vec<_>>(), vec!["train"]);
        assert!(!queue.exists(&ctx, "train_response").await.unwrap());
        assert!(queue.has_work(&ctx, "train_response").await.unwrap_err().is_discovery());

        let handler: Arc<dyn MessageHandler> =
            Arc::new(FnHandler::new(|_ctx, _task| async { HandlerOutcome::ack(None) }));
        let task = TaskEnvelope::new(QueueType::File, "local", "train_response", "", handler);
        let err = queue
            .work(&ctx, &WorkSettings::new(Duration::from_millis(100), 1), &task)
            .await
            .unwrap_err();
        assert!(err.is_discovery());
        assert_eq!(list_messages(&response_dir).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_on_missing_root_is_discovery_error() {
        let queue = FileQueue::new("local", "/nonexistent/quarry-root", FileQueueConfig::default());
        let err = queue
            .refresh(&CancellationToken::new(), None, None)
            .await
            .unwrap_err();
        assert!(err.is_discovery());
    }

    #[tokio::test]
    async fn test_exists_and_has_work() {
        let (_root, queue) = queue_with(&["train"]);
        let ctx = CancellationToken::new();

        assert!(queue.exists(&ctx, "train").await.unwrap());
        assert!(!queue.exists(&ctx, "missing").await.unwrap());
        assert!(queue.exists(&ctx, "..").await.is_err());

        assert!(!queue.has_work(&ctx, "train").await.unwrap());
        assert!(!queue.has_work(&ctx, "missing").await.unwrap());
        queue.publish("train", b"job").await.unwrap();
        assert!(queue.has_work(&ctx, "train").await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_ack_and_nack() {
        let (_root, queue) = queue_with(&["train"]);
        queue.publish("train", b"first").await.unwrap();
        queue.publish("train", b"second").await.unwrap();
        let source = source(&queue, "train", Duration::from_secs(60));

        let mut batch = source.pull(5).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].data().as_ref(), b"first");
        assert!(list_messages(&source.dir).await.unwrap().is_empty());

        let second = batch.pop().unwrap();
        let first = batch.pop().unwrap();
        first.ack().await.unwrap();
        second.nack().await.unwrap();

        assert!(list_messages(&source.lease_dir).await.unwrap().is_empty());
        let remaining = list_messages(&source.dir).await.unwrap();
        assert_eq!(remaining.len(), 1);
        let data = std::fs::read(source.dir.join(&remaining[0])).unwrap();
        assert_eq!(data, b"second");
    }

    #[tokio::test]
    async fn test_expired_leases_are_reclaimed() {
        let (_root, queue) = queue_with(&["train"]);
        queue.publish("train", b"stuck").await.unwrap();
        let source = source(&queue, "train", Duration::from_millis(50));

        let leased = source.pull(1).await.unwrap();
        assert_eq!(leased.len(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let again = source.pull(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].data().as_ref(), b"stuck");

        // The original holder's ack is now a no-op
        leased[0].ack().await.unwrap();
        assert_eq!(list_messages(&source.lease_dir).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_extend_keeps_lease_alive() {
        let (_root, queue) = queue_with(&["train"]);
        queue.publish("train", b"long").await.unwrap();
        let source = source(&queue, "train", Duration::from_millis(150));

        let leased = source.pull(1).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            leased[0].extend(Duration::from_millis(150)).await.unwrap();
        }

        source.reclaim_expired().await.unwrap();
        assert!(list_messages(&source.dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_work_processes_directory() {
        let (_root, queue) = queue_with(&["train"]);
        for i in 0..3 {
            queue.publish("train", format!("job-{}", i).as_bytes()).await.unwrap();
        }
        let handler: Arc<dyn MessageHandler> =
            Arc::new(FnHandler::new(|_ctx, _task| async { HandlerOutcome::ack(None) }));
        let task = TaskEnvelope::new(QueueType::File, "local", "train", "", handler);

        let outcome = queue
            .work(
                &CancellationToken::new(),
                &WorkSettings::new(Duration::from_millis(300), 1),
                &task,
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 3);
        assert_eq!(outcome.stop, StopReason::Deadline);
        assert!(!queue.has_work(&CancellationToken::new(), "train").await.unwrap());
    }

    #[tokio::test]
    async fn test_responder_writes_reports() {
        let (root, queue) = queue_with(&["train"]);
        let ctx = CancellationToken::new();
        assert!(queue.responder(&ctx, "train", None).await.unwrap_err().is_discovery());

        std::fs::create_dir(root.path().join("train_response")).unwrap();
        let tx = queue.responder(&ctx, "train", None).await.unwrap();
        tx.send(Report::new(
            "runner",
            "train",
            ReportPayload::Logging {
                level: "info".to_string(),
                message: "started".to_string(),
            },
        ))
        .await
        .unwrap();

        let response_dir = root.path().join("train_response");
        let mut written = Vec::new();
        for _ in 0..50 {
            written = list_messages(&response_dir).await.unwrap();
            if !written.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(written.len(), 1);
        let report: Report =
            serde_json::from_slice(&std::fs::read(response_dir.join(&written[0])).unwrap())
                .unwrap();
        assert_eq!(report.subscription, "train");
    }
}
