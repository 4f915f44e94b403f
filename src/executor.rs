//! Foreground/background command execution, batch dispatch, and the kill
//! workflow.
//!
//! Grounded on the teacher's `execute_ssh_command` channel-message loop,
//! generalized to dispatch through the [`crate::queue::CommandQueue`] instead
//! of running inline, and on `ExecuteBatch`'s chunk-of-3 partitioning.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::ChannelMsg;
use tokio::sync::mpsc;

use crate::protocol::{BatchCommandResult, ServerEvent};
use crate::queue::{CommandQueue, Priority};
use crate::session::Session;

static KILL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(sudo\s+)?kill\s+-\d+\s+\d+$").expect("valid kill-command regex"));

const BATCH_CHUNK_SIZE: usize = 3;

pub struct CommandExecutor {
    queue: Arc<CommandQueue>,
}

impl CommandExecutor {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self { queue }
    }

    /// Dispatches a single command. Kill-shaped commands are routed to the
    /// kill workflow; everything else goes straight to the queue.
    pub async fn execute_command(
        &self,
        session: &Arc<Session>,
        command: &str,
        background: bool,
        execution_id: Option<String>,
        stream: bool,
        out: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if !session.authenticated.load(Ordering::Relaxed) {
            let _ = out.send(ServerEvent::CommandError {
                command: command.to_string(),
                error: "session is not authenticated".to_string(),
                needs_elevation: false,
            });
            return;
        }

        if KILL_PATTERN.is_match(command) {
            self.run_kill_workflow(session, command, out).await;
            return;
        }

        let stream_target = (stream && !background).then(|| (out, execution_id.clone().unwrap_or_default()));
        let result = self.run_one(session, command, background, stream_target).await;
        session.touch();
        match result {
            Ok((_, Some(error))) => {
                let _ = out.send(ServerEvent::CommandError {
                    command: command.to_string(),
                    error,
                    needs_elevation: false,
                });
            }
            Ok((_, None)) => {}
            Err(e) => {
                let _ = out.send(ServerEvent::CommandError {
                    command: command.to_string(),
                    error: e,
                    needs_elevation: false,
                });
            }
        }
    }

    /// Partitions `commands` into chunks of 3, processing chunks sequentially
    /// while dispatching each chunk's members concurrently through the queue.
    pub async fn execute_batch(
        &self,
        session: &Arc<Session>,
        commands: Vec<String>,
        batch_id: String,
        background: bool,
        out: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if !session.authenticated.load(Ordering::Relaxed) {
            let _ = out.send(ServerEvent::CommandBatchResult {
                batch_id,
                results: vec![],
                error: Some("session is not authenticated".to_string()),
                background,
            });
            return;
        }

        let mut results = Vec::with_capacity(commands.len());
        for chunk in commands.chunks(BATCH_CHUNK_SIZE) {
            let futures = chunk.iter().map(|command| {
                let session = session.clone();
                let command = command.clone();
                async move {
                    let outcome = self.run_one(&session, &command, background, None).await;
                    match outcome {
                        Ok((output, error)) => BatchCommandResult {
                            command,
                            output,
                            error,
                            background,
                        },
                        Err(e) => BatchCommandResult {
                            command,
                            output: String::new(),
                            error: Some(e),
                            background,
                        },
                    }
                }
            });
            results.extend(join_all(futures).await);
        }

        session.touch();
        let _ = out.send(ServerEvent::CommandBatchResult {
            batch_id,
            results,
            error: None,
            background,
        });
    }

    /// Runs one command on its own exec channel via the queue, returning
    /// `(stdout+stderr, Some(error))` where `error` is set when the exit code
    /// is non-zero. When `stream_target` is set, each chunk of stdout is
    /// emitted as a `command-output-stream` event as it arrives.
    async fn run_one(
        &self,
        session: &Arc<Session>,
        command: &str,
        background: bool,
        stream_target: Option<(&mpsc::UnboundedSender<ServerEvent>, String)>,
    ) -> Result<(String, Option<String>), String> {
        let slot = self
            .queue
            .enqueue(
                &session.session_id,
                if background { Priority::Background } else { Priority::Foreground },
            )
            .await
            .map_err(|e| e.to_string())?;

        session.running_background.store(background, Ordering::Relaxed);

        let mut channel = session
            .ssh_handle
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        channel.exec(true, command).await.map_err(|e| e.to_string())?;

        let mut output = Vec::new();
        let mut error_output = Vec::new();
        let mut exit_code: Option<u32> = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    if let Some((out, execution_id)) = &stream_target {
                        let _ = out.send(ServerEvent::CommandOutputStream {
                            execution_id: execution_id.clone(),
                            output: String::from_utf8_lossy(&data).into_owned(),
                            partial: true,
                        });
                    }
                    output.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => error_output.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { .. }) => {}
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => break,
                Some(_) => {}
            }
        }
        let _ = channel.close().await;

        session.running_background.store(false, Ordering::Relaxed);
        drop(slot);

        let stdout = String::from_utf8_lossy(&output).into_owned();
        let stderr = String::from_utf8_lossy(&error_output).into_owned();
        let combined = if stderr.is_empty() { stdout } else { format!("{stdout}{stderr}") };

        let error = match exit_code {
            Some(0) | None => None,
            Some(code) => Some(format!("exited with code {code}")),
        };

        Ok((combined, error))
    }

    /// Runs a kill command, checks for permission failures, verifies the
    /// process actually died, and reports a process-stats snapshot.
    async fn run_kill_workflow(&self, session: &Arc<Session>, command: &str, out: &mpsc::UnboundedSender<ServerEvent>) {
        let pid = extract_pid(command);

        let (stdout_stderr, exit_error) = match self.run_one(session, command, false, None).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = out.send(ServerEvent::CommandError {
                    command: command.to_string(),
                    error: e,
                    needs_elevation: false,
                });
                return;
            }
        };

        let needs_elevation =
            stdout_stderr.contains("Operation not permitted") || stdout_stderr.contains("Permission denied");

        if needs_elevation {
            let _ = out.send(ServerEvent::CommandError {
                command: command.to_string(),
                error: stdout_stderr,
                needs_elevation: true,
            });
            let _ = out.send(ServerEvent::Data {
                data: crate::transport::encode_bytes(
                    b"\r\n\x1b[31mPermission denied killing process; elevation required.\x1b[0m\r\n",
                ),
            });
            return;
        }

        if let Some(error) = exit_error {
            let _ = out.send(ServerEvent::CommandError {
                command: command.to_string(),
                error,
                needs_elevation: false,
            });
            return;
        }

        let Some(pid) = pid else {
            return;
        };

        let verify_cmd = format!("ps -p {pid} > /dev/null 2>&1; echo $?");
        if let Ok((verify_output, _)) = self.run_one(session, &verify_cmd, true, None).await {
            let success = verify_output.trim() != "0";
            let _ = out.send(ServerEvent::ProcessKilled { pid, success });
            let notice = if success {
                format!("\r\n\x1b[32mProcess {pid} terminated.\x1b[0m\r\n")
            } else {
                format!("\r\n\x1b[31mProcess {pid} is still running.\x1b[0m\r\n")
            };
            let _ = out.send(ServerEvent::Data {
                data: crate::transport::encode_bytes(notice.as_bytes()),
            });
        }

        if let Ok((stats, _)) = self.run_one(session, "ps aux --sort=-%cpu | head -20", true, None).await {
            let _ = out.send(ServerEvent::ProcessStatsUpdate { data: stats });
        }
    }
}

fn extract_pid(command: &str) -> Option<u32> {
    command.split_whitespace().last()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_pattern_matches_bare_kill() {
        assert!(KILL_PATTERN.is_match("kill -9 1234"));
    }

    #[test]
    fn test_kill_pattern_matches_sudo_kill() {
        assert!(KILL_PATTERN.is_match("sudo kill -15 42"));
    }

    #[test]
    fn test_kill_pattern_rejects_non_kill() {
        assert!(!KILL_PATTERN.is_match("killall myproc"));
        assert!(!KILL_PATTERN.is_match("kill -9"));
        assert!(!KILL_PATTERN.is_match("rm -rf /"));
    }

    #[test]
    fn test_extract_pid() {
        assert_eq!(extract_pid("kill -9 1234"), Some(1234));
        assert_eq!(extract_pid("sudo kill -15 42"), Some(42));
    }

    #[test]
    fn test_batch_chunk_size() {
        let commands: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        let chunks: Vec<_> = commands.chunks(BATCH_CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[2].len(), 1);
    }
}
