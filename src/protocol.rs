//! Client transport message envelopes.
//!
//! The client transport is a WebSocket carrying one JSON object per text frame.
//! [`ClientMessage`] models every inbound event named in the design; [`ServerEvent`]
//! models every outbound event. Tagged by `event`/`type` so a single `serde_json`
//! parse dispatches to the right variant.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    CheckConnection {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
    Connect {
        host: String,
        port: u16,
        username: String,
        #[serde(rename = "privateKey")]
        private_key: String,
        passphrase: Option<String>,
    },
    ExecuteCommand {
        command: String,
        #[serde(default)]
        background: bool,
        #[serde(rename = "executionId")]
        execution_id: Option<String>,
        #[serde(default)]
        stream: bool,
    },
    ExecuteBatch {
        commands: Vec<String>,
        #[serde(rename = "batchId")]
        batch_id: String,
        #[serde(default)]
        background: bool,
    },
    RestartShell,
    Resize {
        cols: u32,
        rows: u32,
    },
    Input {
        /// Base64-encoded raw bytes (WebSocket text frames cannot carry arbitrary
        /// binary safely once wrapped in a JSON envelope).
        data: String,
    },
    RefreshConnection,
    Disconnect,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected {
        message: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ConnectionExists {
        message: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        message: String,
    },
    Ended {
        message: String,
    },
    Closed {
        message: String,
    },
    Data {
        data: String,
    },
    ErrorData {
        data: String,
    },
    Heartbeat {
        timestamp: i64,
    },
    SystemInfo {
        #[serde(rename = "type")]
        kind: String,
        data: String,
    },
    MonitoringData {
        #[serde(rename = "type")]
        kind: String,
        stats: MonitoringStats,
    },
    CommandOutputStream {
        #[serde(rename = "executionId")]
        execution_id: String,
        output: String,
        partial: bool,
    },
    CommandBatchResult {
        #[serde(rename = "batchId")]
        batch_id: String,
        results: Vec<BatchCommandResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        background: bool,
    },
    CommandError {
        command: String,
        error: String,
        #[serde(rename = "needsElevation")]
        needs_elevation: bool,
    },
    ProcessKilled {
        pid: u32,
        success: bool,
    },
    ProcessStatsUpdate {
        data: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStats {
    pub cpu: MetricValue,
    pub memory: MetricValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricValue {
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCommandResult {
    pub command: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub background: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_connect() {
        let json = r#"{"event":"connect","host":"h","port":22,"username":"u","privateKey":"k"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Connect {
                host,
                port,
                username,
                private_key,
                passphrase,
            } => {
                assert_eq!(host, "h");
                assert_eq!(port, 22);
                assert_eq!(username, "u");
                assert_eq!(private_key, "k");
                assert!(passphrase.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_deserialize_resize() {
        let json = r#"{"event":"resize","cols":120,"rows":40}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Resize { cols, rows } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_deserialize_execute_command_defaults() {
        let json = r#"{"event":"execute-command","command":"ls"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::ExecuteCommand {
                command,
                background,
                stream,
                execution_id,
            } => {
                assert_eq!(command, "ls");
                assert!(!background);
                assert!(!stream);
                assert!(execution_id.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_serialize_connected_event() {
        let event = ServerEvent::Connected {
            message: "ok".to_string(),
            session_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connected");
        assert_eq!(json["sessionId"], "abc");
    }

    #[test]
    fn test_serialize_command_batch_result_omits_none_error() {
        let event = ServerEvent::CommandBatchResult {
            batch_id: "b1".to_string(),
            results: vec![],
            error: None,
            background: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_deserialize_disconnect_no_payload() {
        let json = r#"{"event":"disconnect"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Disconnect));
    }
}
