//! Command handler
//!
//! Runs a configured program once per message: the payload is written to its
//! stdin and the envelope's identity is passed through the environment. Exit
//! status 0 acknowledges the message, anything else returns it for redelivery.
//! When the last line the program prints to stdout is a JSON resource record,
//! it is reported back with the acknowledgment. Only that line is retained,
//! however much the program prints.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use quarry_core::{HandlerOutcome, MessageHandler, Report, ReportPayload, Resource, TaskEnvelope};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `MessageHandler` that runs an external program per message
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    runner_id: String,
}

impl CommandHandler {
    /// Creates a handler from a program followed by its arguments
    pub fn new(command: &[String], runner_id: impl Into<String>) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("handler command cannot be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            runner_id: runner_id.into(),
        })
    }

    fn spawn(&self, task: &TaskEnvelope) -> anyhow::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .env("QUARRY_PROJECT", &task.project)
            .env("QUARRY_SUBSCRIPTION", &task.subscription)
            .env("QUARRY_CREDENTIALS", &task.credentials)
            .env("QUARRY_QUEUE", task.queue_type.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))
    }

    /// Sends a best-effort progress report; a full or absent channel drops it
    fn report(&self, task: &TaskEnvelope, state: &str, message: String) {
        let Some(response_q) = &task.response_q else {
            return;
        };
        let report = Report::new(
            self.runner_id.clone(),
            task.subscription.clone(),
            ReportPayload::Progress {
                state: state.to_string(),
                message,
            },
        );
        if let Err(e) = response_q.try_send(report) {
            debug!(subscription = %task.subscription, error = %e, "Dropped progress report");
        }
    }
}

/// Feeds the payload and follows stdout while waiting for the child to exit
///
/// Returns the exit status and the last non-empty line of output.
async fn run_to_completion(
    child: &mut Child,
    payload: &[u8],
) -> anyhow::Result<(ExitStatus, Option<String>)> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A program that ignores its input closes the pipe early
            if let Err(e) = stdin.write_all(payload).await {
                debug!(error = %e, "Handler did not consume the whole payload");
            }
        }
    };
    let follow = async move {
        match stdout {
            Some(stdout) => last_line(stdout).await.context("Failed to read handler output"),
            None => Ok(None),
        }
    };

    let ((), last) = tokio::join!(feed, follow);
    let status = child.wait().await.context("Failed to wait for handler")?;
    Ok((status, last?))
}

/// Drains `reader`, keeping only its last non-empty line
async fn last_line<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut last = None;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(last);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if !text.is_empty() {
            last = Some(text.to_string());
        }
    }
}

/// Parses a line of handler output as a resource record
fn parse_resource(line: Option<&str>) -> Option<Resource> {
    serde_json::from_str(line?).ok()
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, ctx: CancellationToken, task: &TaskEnvelope) -> HandlerOutcome {
        let mut child = match self.spawn(task) {
            Ok(child) => child,
            Err(e) => return HandlerOutcome::nack(Some(e)),
        };

        debug!(
            subscription = %task.subscription,
            program = %self.program,
            bytes = task.msg.len(),
            "Started handler"
        );
        self.report(task, "started", format!("running {}", self.program));

        let finished = tokio::select! {
            _ = ctx.cancelled() => None,
            result = run_to_completion(&mut child, &task.msg) => Some(result),
        };

        match finished {
            None => {
                if let Err(e) = child.kill().await {
                    warn!(subscription = %task.subscription, error = %e, "Failed to kill handler");
                }
                info!(subscription = %task.subscription, "Handler interrupted by shutdown");
                self.report(task, "interrupted", "runner is shutting down".to_string());
                HandlerOutcome::nack(Some(anyhow!("handler interrupted by shutdown")))
            }
            Some(Err(e)) => {
                self.report(task, "failed", format!("{:#}", e));
                HandlerOutcome::nack(Some(e))
            }
            Some(Ok((status, last))) if status.success() => {
                self.report(task, "finished", "exit status 0".to_string());
                HandlerOutcome::ack(parse_resource(last.as_deref()))
            }
            Some(Ok((status, _))) => {
                self.report(task, "failed", status.to_string());
                HandlerOutcome::nack(Some(anyhow!("{} exited with {}", self.program, status)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quarry_core::QueueType;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn shell(script: &str) -> CommandHandler {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandHandler::new(&command, "runner-1").unwrap()
    }

    fn envelope(handler: CommandHandler, payload: &'static str) -> TaskEnvelope {
        TaskEnvelope::new(QueueType::Memory, "proj", "train", "/etc/token", Arc::new(handler))
            .for_delivery(Bytes::from(payload))
    }

    async fn run(script: &str, payload: &'static str) -> HandlerOutcome {
        let task = envelope(shell(script), payload);
        task.handler.handle(CancellationToken::new(), &task).await
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandHandler::new(&[], "runner").is_err());
    }

    #[tokio::test]
    async fn test_last_line_and_resource() {
        let stdout: &[u8] = b"epoch 1\nepoch 2\n{\"cpus\": 4, \"gpus\": 1, \"gpuMem\": \"16gb\"}\n\n";
        let last = last_line(stdout).await.unwrap();
        let resource = parse_resource(last.as_deref()).unwrap();
        assert_eq!(resource.cpus, 4);
        assert_eq!(resource.gpu_mem, "16gb");

        let last = last_line(&b"done"[..]).await.unwrap();
        assert_eq!(last.as_deref(), Some("done"));
        assert!(parse_resource(last.as_deref()).is_none());
        assert!(last_line(&b"\n\n"[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_long_output_keeps_final_record() {
        let script = r#"i=0
            while [ $i -lt 20000 ]; do echo "step $i loss 0.$i"; i=$((i + 1)); done
            echo '{"cpus": 8}'"#;
        let outcome = run(script, "").await;
        assert!(outcome.ack);
        assert_eq!(outcome.resource.unwrap().cpus, 8);
    }

    #[tokio::test]
    async fn test_exit_status_decides_ack() {
        let outcome = run("cat > /dev/null", "payload").await;
        assert!(outcome.ack);
        assert!(outcome.resource.is_none());

        let outcome = run("exit 3", "payload").await;
        assert!(!outcome.ack);
        assert!(outcome.error.unwrap().to_string().contains("exit status: 3"));
    }

    #[tokio::test]
    async fn test_payload_and_environment() {
        let script = r#"read line
            test "$line" = "hello" || exit 1
            test "$QUARRY_SUBSCRIPTION" = "train" || exit 2
            test "$QUARRY_QUEUE" = "memory" || exit 3
            test "$QUARRY_CREDENTIALS" = "/etc/token" || exit 4
            echo '{"cpus": 2}'"#;
        let outcome = run(script, "hello\n").await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert!(outcome.ack);
        assert_eq!(outcome.resource.unwrap().cpus, 2);
    }

    #[tokio::test]
    async fn test_missing_program_nacks() {
        let command = vec!["/nonexistent/quarry-handler".to_string()];
        let handler = CommandHandler::new(&command, "runner").unwrap();
        let task = envelope(handler, "x");
        let outcome = task.handler.handle(CancellationToken::new(), &task).await;
        assert!(!outcome.ack);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let task = envelope(shell("sleep 30"), "");
        let ctx = CancellationToken::new();

        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let outcome = task.handler.handle(ctx, &task).await;
        assert!(!outcome.ack);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_progress_reports() {
        let (tx, mut rx) = mpsc::channel(8);
        let task = envelope(shell("true"), "").with_response_q(tx);
        let outcome = task.handler.handle(CancellationToken::new(), &task).await;
        assert!(outcome.ack);

        let mut states = Vec::new();
        while let Ok(report) = rx.try_recv() {
            assert_eq!(report.executor_id, "runner-1");
            if let ReportPayload::Progress { state, .. } = report.payload {
                states.push(state);
            }
        }
        assert_eq!(states, vec!["started", "finished"]);
    }
}
