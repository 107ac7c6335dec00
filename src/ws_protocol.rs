//! WebSocket Control Protocol: the sole in-process control plane for UI
//! clients — validation, folder add/remove, model catalog, snapshot
//! retrieval, liveness. See `SPEC_FULL.md` §4 / spec.md §4.6.
//!
//! axum's built-in `ws` feature is used for the transport rather than
//! pulling in a standalone websocket crate, since axum is already the
//! daemon's HTTP stack.

use crate::error::DaemonError;
use crate::kernel::DaemonKernel;
use crate::types::{ClientConnection, ClientType, FolderEntry};
use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Closed set of inbound message types. Anything else is `UNKNOWN_MESSAGE_TYPE`.
pub const SUPPORTED_TYPES: &[&str] = &[
    "connection.init",
    "folder.validate",
    "folder.add",
    "folder.remove",
    "ping",
    "models.list",
    "models.recommend",
    "getFoldersConfig",
    "get_server_info",
    "get_folder_info",
];

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    id: Option<String>,
    #[serde(flatten)]
    payload: Value,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(flatten)]
    payload: Value,
}

fn ok_reply(msg_type: &str, id: Option<String>, payload: Value) -> String {
    serde_json::to_string(&OutboundEnvelope { msg_type: msg_type.to_string(), id, payload })
        .unwrap_or_else(|_| "{}".to_string())
}

fn error_reply(code: &str, message: &str, id: Option<String>, supported_types: Option<&[&str]>) -> String {
    let mut payload = serde_json::json!({ "code": code, "message": message });
    if let Some(types) = supported_types {
        payload["supportedTypes"] = serde_json::json!(types);
    }
    serde_json::to_string(&OutboundEnvelope { msg_type: "error".to_string(), id, payload })
        .unwrap_or_else(|_| "{}".to_string())
}

#[derive(Debug, Deserialize)]
struct FolderAddRequest {
    path: PathBuf,
    #[serde(rename = "modelId")]
    model_id: String,
}

#[derive(Debug, Deserialize)]
struct FolderRemoveRequest {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FolderValidateRequest {
    path: PathBuf,
    #[serde(rename = "modelId")]
    model_id: Option<String>,
}

/// Dispatches one inbound frame and returns `(reply, push_snapshot)` — the
/// JSON text of the reply, and whether the caller should additionally push
/// the current FMDM snapshot right after it (true only for
/// `connection.init`, per spec.md §4.6's "new connection receives the
/// current snapshot"). Pure function of (kernel, raw text) so it's testable
/// without a live socket.
pub async fn dispatch(kernel: &Arc<DaemonKernel>, raw: &str) -> (String, bool) {
    let envelope: InboundEnvelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(_) => return (error_reply("INVALID_MESSAGE", "malformed frame", None, None), false),
    };

    if !SUPPORTED_TYPES.contains(&envelope.msg_type.as_str()) {
        return (
            error_reply(
                "UNKNOWN_MESSAGE_TYPE",
                &format!("unsupported message type '{}'", envelope.msg_type),
                envelope.id,
                Some(SUPPORTED_TYPES),
            ),
            false,
        );
    }

    match envelope.msg_type.as_str() {
        "connection.init" => {
            (ok_reply("connection.ack", envelope.id, serde_json::json!({})), true)
        }
        "ping" => (ok_reply("pong", envelope.id, serde_json::json!({})), false),
        "models.list" => (
            ok_reply(
                "models.list.reply",
                envelope.id,
                serde_json::json!({ "models": kernel.supported_models() }),
            ),
            false,
        ),
        "models.recommend" => (
            ok_reply(
                "models.recommend.reply",
                envelope.id,
                serde_json::json!({ "recommended": kernel.supported_models().first().cloned() }),
            ),
            false,
        ),
        "getFoldersConfig" | "get_server_info" => {
            let snapshot = kernel.fmdm.current();
            (
                ok_reply(
                    "getFoldersConfig.reply",
                    envelope.id,
                    serde_json::json!({
                        "folders": snapshot.folders,
                        "daemonVersion": snapshot.daemon_version,
                        "revision": snapshot.revision,
                    }),
                ),
                false,
            )
        }
        "get_folder_info" => {
            let path: Result<PathBuf, _> = serde_json::from_value(envelope.payload.get("path").cloned().unwrap_or(Value::Null));
            let reply = match path {
                Ok(path) => match kernel.folder_info(&path) {
                    Some(entry) => ok_reply("get_folder_info.reply", envelope.id, serde_json::json!(entry)),
                    None => error_reply("FOLDER_NOT_FOUND", "no such folder", envelope.id, None),
                },
                Err(_) => error_reply("INVALID_MESSAGE", "missing or malformed 'path'", envelope.id, None),
            };
            (reply, false)
        }
        "folder.validate" => {
            let reply = match serde_json::from_value::<FolderValidateRequest>(envelope.payload) {
                Ok(req) => match kernel.validate_folder(&req.path, req.model_id.as_deref()) {
                    Ok(()) => ok_reply("folder.validate.reply", envelope.id, serde_json::json!({ "valid": true })),
                    Err(e) => error_reply(&validation_code(&e), &e.to_string(), envelope.id, None),
                },
                Err(_) => error_reply("INVALID_MESSAGE", "malformed folder.validate payload", envelope.id, None),
            };
            (reply, false)
        }
        "folder.add" => {
            let reply = match serde_json::from_value::<FolderAddRequest>(envelope.payload) {
                Ok(req) => match kernel.add_folder(req.path, req.model_id).await {
                    Ok(warning) => ok_reply(
                        "folder.add.reply",
                        envelope.id,
                        serde_json::json!({ "success": true, "warning": warning }),
                    ),
                    Err(e) => error_reply(&validation_code(&e), &e.to_string(), envelope.id, None),
                },
                Err(_) => error_reply("INVALID_MESSAGE", "malformed folder.add payload", envelope.id, None),
            };
            (reply, false)
        }
        "folder.remove" => {
            let reply = match serde_json::from_value::<FolderRemoveRequest>(envelope.payload) {
                Ok(req) => {
                    kernel.remove_folder(&req.path).await;
                    ok_reply("folder.remove.reply", envelope.id, serde_json::json!({ "success": true }))
                }
                Err(_) => error_reply("INVALID_MESSAGE", "malformed folder.remove payload", envelope.id, None),
            };
            (reply, false)
        }
        other => (
            error_reply("UNKNOWN_MESSAGE_TYPE", &format!("unhandled '{other}'"), envelope.id, Some(SUPPORTED_TYPES)),
            false,
        ),
    }
}

fn validation_code(e: &DaemonError) -> String {
    match e.kind() {
        crate::error::ErrorKind::Validation => "VALIDATION_ERROR".to_string(),
        _ => "INTERNAL_ERROR".to_string(),
    }
}

/// Drives one accepted connection: registers it, sends `connection.ack`
/// followed immediately by the current FMDM snapshot, then loops dispatching
/// frames (each pushing its own snapshot when `dispatch` asks for one) until
/// the socket closes.
pub async fn handle_socket(kernel: Arc<DaemonKernel>, mut socket: WebSocket) {
    let connection_id = kernel.register_connection(ClientType::Unknown);
    info!(connection_id, "websocket connection opened");

    let mut fmdm_rx = kernel.fmdm.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        kernel.touch_connection(&connection_id);
                        let (reply, push_snapshot) = dispatch(&kernel, &text).await;
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                        if push_snapshot {
                            let snapshot = kernel.fmdm.current();
                            let frame = ok_reply("fmdm.update", None, serde_json::json!(*snapshot));
                            if socket.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection_id, error = %e, "websocket recv error");
                        break;
                    }
                }
            }
            snapshot = fmdm_rx.recv() => {
                if let Ok(snapshot) = snapshot {
                    let frame = ok_reply("fmdm.update", None, serde_json::json!(*snapshot));
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    kernel.unregister_connection(&connection_id);
    info!(connection_id, "websocket connection closed");
}

pub fn new_connection(client_type: ClientType) -> ClientConnection {
    let now = crate::types::now_ms();
    ClientConnection {
        connection_id: Uuid::new_v4().to_string(),
        client_type,
        connected_at: now,
        last_activity: now,
    }
}

#[allow(dead_code)]
fn _assert_folder_entry_serializes(entry: &FolderEntry) -> Value {
    serde_json::json!(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::embedding_worker::StubEmbeddingWorker;
    use crate::model_registry::ModelRegistry;
    use crate::queue::{FolderLifecycle, IndexingQueue};
    use std::path::PathBuf;

    struct NoopLifecycle;
    #[async_trait::async_trait]
    impl FolderLifecycle for NoopLifecycle {
        async fn run(
            &self,
            _folder: &PathBuf,
            _model_id: &str,
            _on_progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<(), String> {
            Ok(())
        }
    }

    async fn test_kernel() -> Arc<DaemonKernel> {
        let registry = Arc::new(ModelRegistry::new(Arc::new(|| {
            Box::new(StubEmbeddingWorker::new()) as Box<dyn crate::embedding_worker::EmbeddingWorker>
        })));
        let queue = IndexingQueue::new(Arc::clone(&registry), Arc::new(NoopLifecycle));
        Arc::new(DaemonKernel::for_test(DaemonConfig::default(), registry, queue))
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let kernel = test_kernel().await;
        let (reply, push) = dispatch(&kernel, r#"{"type":"bogus.thing"}"#).await;
        assert!(reply.contains("UNKNOWN_MESSAGE_TYPE"));
        assert!(!push);
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_message() {
        let kernel = test_kernel().await;
        let (reply, push) = dispatch(&kernel, "not json").await;
        assert!(reply.contains("INVALID_MESSAGE"));
        assert!(!push);
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let kernel = test_kernel().await;
        let (reply, push) = dispatch(&kernel, r#"{"type":"ping","id":"1"}"#).await;
        assert!(reply.contains("\"pong\""));
        assert!(reply.contains("\"id\":\"1\""));
        assert!(!push);
    }

    #[tokio::test]
    async fn connection_init_acks_and_requests_snapshot_push() {
        let kernel = test_kernel().await;
        let (reply, push) = dispatch(&kernel, r#"{"type":"connection.init"}"#).await;
        assert!(reply.contains("connection.ack"));
        assert!(push);
    }
}
