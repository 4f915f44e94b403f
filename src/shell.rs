//! Pumps terminal I/O between the SSH shell channel and the client transport.
//!
//! Grounded on the device-session pattern of owning the whole `Channel`
//! inside one spawned task and communicating with it over `mpsc` channels
//! (no read/write split), and on the teacher's `execute_ssh_command`
//! channel-message loop for collecting output from a freshly opened exec
//! channel.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use russh::ChannelMsg;
use tokio::sync::mpsc;

use crate::protocol::ServerEvent;
use crate::queue::Priority;
use crate::session::Session;

/// Commands the output pump task accepts over its private channel.
pub enum ShellCommand {
    Input(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

pub struct ShellStreamer {
    session: Arc<Session>,
    queue: Arc<crate::queue::CommandQueue>,
    out: mpsc::UnboundedSender<ServerEvent>,
}

impl ShellStreamer {
    pub fn new(
        session: Arc<Session>,
        queue: Arc<crate::queue::CommandQueue>,
        out: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self { session, queue, out }
    }

    /// Opens the PTY, guarded by a 5s timeout, and spawns the I/O pump plus
    /// the post-open background initialization and monitoring tasks.
    pub async fn open(&self) -> Result<(), String> {
        let cols = self.session.cols.load(Ordering::Relaxed) as u32;
        let rows = self.session.rows.load(Ordering::Relaxed) as u32;

        let open_fut = async {
            let channel = self
                .session
                .ssh_handle
                .channel_open_session()
                .await
                .map_err(|e| e.to_string())?;
            channel
                .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
                .await
                .map_err(|e| e.to_string())?;
            channel.request_shell(false).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(channel)
        };

        let channel = tokio::time::timeout(
            Duration::from_secs(crate::config::DEFAULT_SHELL_OPEN_TIMEOUT_SECS),
            open_fut,
        )
        .await
        .map_err(|_| "shell open timed out".to_string())??;

        self.session.set_output(self.out.clone()).await;

        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        *self.session.shell_tx.lock().await = Some(shell_tx);

        self.spawn_pump(channel, shell_rx);
        self.spawn_background_init();
        self.spawn_monitoring_loop();

        Ok(())
    }

    fn spawn_pump(&self, mut channel: russh::Channel<russh::client::Msg>, mut commands: mpsc::UnboundedReceiver<ShellCommand>) {
        let session = self.session.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut flush = tokio::time::interval(Duration::from_millis(crate::config::DEFAULT_OUTPUT_COALESCE_MS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = channel.close().await;
                        break;
                    }
                    cmd = commands.recv() => {
                        match cmd {
                            Some(ShellCommand::Input(data)) => {
                                if channel.data(data.as_slice()).await.is_err() {
                                    break;
                                }
                            }
                            Some(ShellCommand::Resize { cols, rows }) => {
                                let _ = channel.window_change(cols, rows, 0, 0).await;
                            }
                            Some(ShellCommand::Close) | None => {
                                let _ = channel.close().await;
                                break;
                            }
                        }
                    }
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                if !session.running_background.load(Ordering::Relaxed) {
                                    buffer.extend_from_slice(&data);
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                                session.emit(ServerEvent::ErrorData {
                                    data: crate::transport::encode_bytes(&data),
                                }).await;
                            }
                            Some(ChannelMsg::ExtendedData { .. }) => {}
                            Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => {
                                if !buffer.is_empty() {
                                    session.emit(ServerEvent::Data { data: crate::transport::encode_bytes(&buffer) }).await;
                                    buffer.clear();
                                }
                                session.emit(ServerEvent::Closed { message: "shell closed".to_string() }).await;
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                    _ = flush.tick() => {
                        if !buffer.is_empty() {
                            session.emit(ServerEvent::Data { data: crate::transport::encode_bytes(&buffer) }).await;
                            buffer.clear();
                        }
                    }
                }
            }
        });
    }

    fn spawn_background_init(&self) {
        let session = self.session.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            for command in ["uname -a", "uptime"] {
                if session.cancel.is_cancelled() {
                    return;
                }
                if let Ok(slot) = queue.enqueue(&session.session_id, Priority::Background).await {
                    session.running_background.store(true, Ordering::Relaxed);
                    let result = run_background_command(&session, command).await;
                    session.running_background.store(false, Ordering::Relaxed);
                    drop(slot);
                    if let Ok(output) = result {
                        session
                            .emit(ServerEvent::SystemInfo {
                                kind: command.to_string(),
                                data: output,
                            })
                            .await;
                    }
                }
            }
        });
    }

    fn spawn_monitoring_loop(&self) {
        let session = self.session.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if session.cancel.is_cancelled() {
                    return;
                }
                let Ok(slot) = queue.enqueue(&session.session_id, Priority::Background).await else {
                    continue;
                };
                session.running_background.store(true, Ordering::Relaxed);
                let cpu = run_background_command(&session, "top -bn1 | grep 'Cpu(s)'").await;
                let mem = run_background_command(&session, "free -m | awk '/Mem:/{print $3/$2*100}'").await;
                session.running_background.store(false, Ordering::Relaxed);
                drop(slot);

                if let (Ok(cpu), Ok(mem)) = (cpu, mem) {
                    let cpu_value = parse_first_float(&cpu).unwrap_or(0.0);
                    let mem_value = parse_first_float(&mem).unwrap_or(0.0);
                    session
                        .emit(ServerEvent::MonitoringData {
                            kind: "system-stats".to_string(),
                            stats: crate::protocol::MonitoringStats {
                                cpu: crate::protocol::MetricValue { value: cpu_value },
                                memory: crate::protocol::MetricValue { value: mem_value },
                            },
                        })
                        .await;
                }
            }
        });
    }
}

/// Runs a short diagnostic command on its own exec channel, separate from the
/// PTY, and returns its collected stdout.
async fn run_background_command(session: &Session, command: &str) -> Result<String, String> {
    let mut channel = session
        .ssh_handle
        .channel_open_session()
        .await
        .map_err(|e| e.to_string())?;
    channel.exec(true, command).await.map_err(|e| e.to_string())?;

    let mut stdout = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => break,
            _ => {}
        }
    }
    let _ = channel.close().await;
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

fn parse_first_float(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_float_extracts_leading_number() {
        assert_eq!(parse_first_float("23.5 us,"), Some(23.5));
        assert_eq!(parse_first_float("no numbers here"), None);
        assert_eq!(parse_first_float("12"), Some(12.0));
    }
}
