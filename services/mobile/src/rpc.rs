//! 命令 RPC（mobile 侧）：响应按 id 配对，预算 15 秒。

use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::Value;
use tokio::sync::mpsc;

use cs_endpoint_core::RelayEvent;

/// 命令响应预算。
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// 等待指定 desktop 对指定请求 id 的响应。
/// 等待期间的流事件打到 stderr，不与结果输出混流。
pub(crate) async fn await_response(
    events: &mut mpsc::UnboundedReceiver<RelayEvent>,
    from: &str,
    request_id: &str,
    budget: Duration,
) -> anyhow::Result<Value> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow!("command timed out after {}s", budget.as_secs()))?
            .ok_or_else(|| anyhow!("relay client event stream closed"))?;

        match event {
            RelayEvent::EncryptedMessage { from: sender, body } if sender == from => {
                match body.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "response" => {
                        if body.get("id").and_then(Value::as_str) != Some(request_id) {
                            continue;
                        }
                        if let Some(error) = body.get("error").and_then(Value::as_str) {
                            bail!("desktop error: {error}");
                        }
                        return Ok(body.get("result").cloned().unwrap_or(Value::Null));
                    }
                    "event" => {
                        eprintln!("[event] {}", serde_json::to_string(&body).unwrap_or_default());
                    }
                    _ => {}
                }
            }
            RelayEvent::RepairRequired { device_id, reason } if device_id == from => {
                bail!("e2ee session dropped ({reason}); re-pair required");
            }
            RelayEvent::ServerError { code, message } => {
                bail!("relay error: {code} {message}");
            }
            RelayEvent::Disconnected => {
                bail!("relay connection lost while waiting for response");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn matching_response_resolves() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(RelayEvent::EncryptedMessage {
            from: "dev_other".to_string(),
            body: json!({"type":"response","id":"r1","result":"wrong peer"}),
        })
        .unwrap();
        tx.send(RelayEvent::EncryptedMessage {
            from: "dev_d".to_string(),
            body: json!({"type":"response","id":"r0","result":"wrong id"}),
        })
        .unwrap();
        tx.send(RelayEvent::EncryptedMessage {
            from: "dev_d".to_string(),
            body: json!({"type":"response","id":"r1","result":{"pid":7}}),
        })
        .unwrap();

        let value = await_response(&mut rx, "dev_d", "r1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value["pid"], 7);
    }

    #[tokio::test]
    async fn error_response_bails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(RelayEvent::EncryptedMessage {
            from: "dev_d".to_string(),
            body: json!({"type":"response","id":"r1","error":"Channel not allowed"}),
        })
        .unwrap();
        let err = await_response(&mut rx, "dev_d", "r1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Channel not allowed"));
    }

    #[tokio::test]
    async fn budget_elapses_into_timeout() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();
        let err = await_response(&mut rx, "dev_d", "r1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn repair_required_aborts_wait() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(RelayEvent::RepairRequired {
            device_id: "dev_d".to_string(),
            reason: "authentication tag verify failed".to_string(),
        })
        .unwrap();
        let err = await_response(&mut rx, "dev_d", "r1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("re-pair"));
    }
}
