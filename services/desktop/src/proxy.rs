//! 命令代理模块职责：
//! 1. 解析 E2EE 明文中的 command 帧并按白名单通道分发。
//! 2. 每个请求恰好产生一条 response；处理异常转为 `error` 字段。
//! 3. 维护聊天进程 → 发起端路由，流事件按路由回发。

use std::{collections::HashMap, path::PathBuf, time::Instant};

use anyhow::anyhow;
use serde_json::{Value, json};
use sysinfo::System;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    channels::{
        self,
        chat::{ChatEvent, ChatRuntime},
        files, sessions, vcs,
    },
    config::Config,
};

/// 白名单通道。名单外的一律拒绝。
pub(crate) const ALLOWED_CHANNELS: &[&str] = &[
    "claude:spawn",
    "claude:send",
    "claude:kill",
    "sessions:list",
    "sessions:messages",
    "git:status",
    "git:log",
    "git:diff",
    "files:search",
    "app:info",
];

/// 命令代理。
pub(crate) struct CommandProxy {
    chat: ChatRuntime,
    /// 聊天进程 → 发起命令的 mobile；流事件按此路由。
    stream_routes: HashMap<u32, String>,
    sys: System,
    started_at: Instant,
    device_name: String,
    sessions_dir: PathBuf,
    workspace_dir: PathBuf,
}

impl CommandProxy {
    /// 创建代理与聊天事件接收端。
    pub(crate) fn new(cfg: &Config) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (chat, chat_events) = ChatRuntime::new(cfg.chat_command.clone());
        (
            Self {
                chat,
                stream_routes: HashMap::new(),
                sys: System::new(),
                started_at: Instant::now(),
                device_name: cfg.device_name.clone(),
                sessions_dir: cfg.sessions_dir.clone(),
                workspace_dir: cfg.workspace_dir.clone(),
            },
            chat_events,
        )
    }

    /// 处理对端明文。只认 command 帧；返回应回发给来源的 response。
    pub(crate) async fn handle_message(&mut self, from: &str, body: &Value) -> Option<Value> {
        let msg_type = body.get("type").and_then(Value::as_str).unwrap_or_default();
        if msg_type != "command" {
            debug!("ignore non-command payload from {from}: type={msg_type}");
            return None;
        }

        // 没有 id 无法做响应关联，只能丢弃。
        let Some(id) = body.get("id").and_then(Value::as_str).map(str::to_string) else {
            debug!("drop command without id from {from}");
            return None;
        };
        let channel = body
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = body
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if !ALLOWED_CHANNELS.contains(&channel.as_str()) {
            return Some(json!({
                "type": "response",
                "id": id,
                "error": "Channel not allowed",
            }));
        }

        match self.dispatch(from, &channel, &args).await {
            Ok(result) => Some(json!({ "type": "response", "id": id, "result": result })),
            Err(err) => Some(json!({ "type": "response", "id": id, "error": err.to_string() })),
        }
    }

    /// 白名单内通道的实际分发。
    async fn dispatch(&mut self, from: &str, channel: &str, args: &[Value]) -> anyhow::Result<Value> {
        match channel {
            "claude:spawn" => {
                let cwd = args.first().and_then(Value::as_str);
                let extra = args
                    .get(1)
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let pid = self.chat.spawn(cwd, &extra)?;
                self.stream_routes.insert(pid, from.to_string());
                Ok(json!({ "pid": pid }))
            }
            "claude:send" => {
                let pid = required_pid(args)?;
                let text = args
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("claude:send requires text"))?;
                self.chat.send(pid, text).await?;
                Ok(json!({ "ok": true }))
            }
            "claude:kill" => {
                let pid = required_pid(args)?;
                self.chat.kill(pid)?;
                Ok(json!({ "ok": true }))
            }
            "sessions:list" => sessions::list(&self.sessions_dir),
            "sessions:messages" => {
                let id = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("sessions:messages requires a session id"))?;
                sessions::messages(&self.sessions_dir, id)
            }
            "git:status" => vcs::run(&self.workspace_dir, "status", args).await,
            "git:log" => vcs::run(&self.workspace_dir, "log", args).await,
            "git:diff" => vcs::run(&self.workspace_dir, "diff", args).await,
            "files:search" => {
                let query = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("files:search requires a query"))?;
                let limit = args.get(1).and_then(Value::as_u64).unwrap_or(50) as usize;
                Ok(files::search(&self.workspace_dir, query, limit))
            }
            "app:info" => Ok(channels::app_info(
                &mut self.sys,
                self.started_at,
                &self.device_name,
            )),
            other => Err(anyhow!("Channel not allowed: {other}")),
        }
    }

    /// 聊天事件 → (目标 mobile, 事件帧)。退出事件顺带清路由。
    pub(crate) fn on_chat_event(&mut self, event: ChatEvent) -> Option<(String, Value)> {
        match event {
            ChatEvent::Output { pid, stream, line } => {
                let to = self.stream_routes.get(&pid)?.clone();
                Some((
                    to,
                    json!({
                        "type": "event",
                        "channel": "claude:stream",
                        "data": { "pid": pid, "stream": stream, "line": line },
                    }),
                ))
            }
            ChatEvent::Exited { pid, code } => {
                self.chat.forget(pid);
                let to = self.stream_routes.remove(&pid)?;
                Some((
                    to,
                    json!({
                        "type": "event",
                        "channel": "claude:exit",
                        "data": { "pid": pid, "code": code },
                    }),
                ))
            }
        }
    }

    /// 进程收尾。
    pub(crate) fn abort_all(&mut self) {
        self.chat.abort_all();
    }
}

/// 从 args[0] 取 pid。
fn required_pid(args: &[Value]) -> anyhow::Result<u32> {
    args.first()
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| anyhow!("missing pid argument"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_cfg() -> Config {
        let scratch = std::env::temp_dir().join(format!("cs-proxy-{}", Uuid::new_v4().simple()));
        Config {
            relay_url: "http://127.0.0.1:18080".to_string(),
            token: "sat_v1.a.b".to_string(),
            device_id: "dev_d".to_string(),
            device_name: "Desk".to_string(),
            admin_addr: "127.0.0.1:0".to_string(),
            unlock_secret: "666666".to_string(),
            allow_remote_control: true,
            auto_lock_timeout: Duration::ZERO,
            chat_command: "cat".to_string(),
            sessions_dir: scratch.join("sessions"),
            workspace_dir: scratch,
            config_root: None,
        }
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let cfg = test_cfg();
        let (mut proxy, _events) = CommandProxy::new(&cfg);
        let resp = proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r1","channel":"shell:exec","args":["rm -rf /"]}),
            )
            .await
            .unwrap();
        assert_eq!(resp["error"], "Channel not allowed");
        assert_eq!(resp["id"], "r1");
        assert!(resp.get("result").is_none());
    }

    #[tokio::test]
    async fn command_without_id_is_dropped() {
        let cfg = test_cfg();
        let (mut proxy, _events) = CommandProxy::new(&cfg);
        assert!(
            proxy
                .handle_message("dev_m", &json!({"type":"command","channel":"app:info"}))
                .await
                .is_none()
        );
        assert!(
            proxy
                .handle_message("dev_m", &json!({"type":"event","channel":"x","data":{}}))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn app_info_responds_with_result() {
        let cfg = test_cfg();
        let (mut proxy, _events) = CommandProxy::new(&cfg);
        let resp = proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r2","channel":"app:info","args":[]}),
            )
            .await
            .unwrap();
        assert_eq!(resp["type"], "response");
        assert_eq!(resp["id"], "r2");
        assert_eq!(resp["result"]["deviceName"], "Desk");
    }

    #[tokio::test]
    async fn handler_error_becomes_response_error() {
        let cfg = test_cfg();
        let (mut proxy, _events) = CommandProxy::new(&cfg);
        let resp = proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r3","channel":"sessions:messages","args":["../x"]}),
            )
            .await
            .unwrap();
        assert!(resp["error"].as_str().unwrap().contains("invalid session id"));
    }

    #[tokio::test]
    async fn spawn_routes_stream_events_and_exit_clears_route() {
        let cfg = test_cfg();
        let (mut proxy, mut events) = CommandProxy::new(&cfg);
        let resp = proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r4","channel":"claude:spawn","args":[]}),
            )
            .await
            .unwrap();
        let pid = resp["result"]["pid"].as_u64().unwrap() as u32;

        proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r5","channel":"claude:send","args":[pid, "ping"]}),
            )
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        let (to, frame) = proxy.on_chat_event(event).unwrap();
        assert_eq!(to, "dev_m");
        assert_eq!(frame["channel"], "claude:stream");
        assert_eq!(frame["data"]["line"], "ping");

        proxy
            .handle_message(
                "dev_m",
                &json!({"type":"command","id":"r6","channel":"claude:kill","args":[pid]}),
            )
            .await
            .unwrap();
        loop {
            let event = events.recv().await.unwrap();
            let exited = matches!(event, ChatEvent::Exited { .. });
            let routed = proxy.on_chat_event(event);
            if exited {
                let (_, frame) = routed.unwrap();
                assert_eq!(frame["channel"], "claude:exit");
                break;
            }
        }
        // 路由已清理：后续同 pid 事件无处可去。
        assert!(
            proxy
                .on_chat_event(ChatEvent::Output {
                    pid,
                    stream: "stdout",
                    line: "late".to_string()
                })
                .is_none()
        );
    }
}
