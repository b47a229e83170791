//! 聊天子进程运行时职责：
//! 1. 按请求拉起聊天 CLI 进程，stdout/stderr 按行转为流事件。
//! 2. 维护 pid → 进程句柄映射，支持注入输入与终止。
//! 3. 进程退出时上报 exit 事件，供代理层清理路由。

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

/// 聊天进程产生的事件。
#[derive(Debug)]
pub(crate) enum ChatEvent {
    /// 一行输出（stream 为 `stdout` / `stderr`）。
    Output {
        pid: u32,
        stream: &'static str,
        line: String,
    },
    /// 进程退出。
    Exited { pid: u32, code: Option<i32> },
}

/// 单个存活进程的控制句柄。
struct ChildHandle {
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// 聊天子进程运行时。
pub(crate) struct ChatRuntime {
    command: String,
    children: HashMap<u32, ChildHandle>,
    event_tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatRuntime {
    /// 创建运行时并返回事件接收端（主循环消费）。
    pub(crate) fn new(command: String) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                command,
                children: HashMap::new(),
                event_tx,
            },
            event_rx,
        )
    }

    /// 拉起一个聊天进程；可选工作目录与启动参数。
    pub(crate) fn spawn(&mut self, cwd: Option<&str>, args: &[String]) -> anyhow::Result<u32> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd.map(str::trim).filter(|v| !v.is_empty()) {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn chat process failed: {}", self.command))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("chat process exited before pid was known"))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(pid, "stdout", stdout, self.event_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(pid, "stderr", stderr, self.event_tx.clone());
        }
        let stdin = child.stdin.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        spawn_supervisor(pid, child, kill_rx, self.event_tx.clone());

        self.children.insert(
            pid,
            ChildHandle {
                stdin,
                kill_tx: Some(kill_tx),
            },
        );
        debug!("chat process spawned pid={pid}");
        Ok(pid)
    }

    /// 向进程 stdin 注入一行输入。
    pub(crate) async fn send(&mut self, pid: u32, text: &str) -> anyhow::Result<()> {
        let handle = self
            .children
            .get_mut(&pid)
            .ok_or_else(|| anyhow!("no chat process with pid {pid}"))?;
        let stdin = handle
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("chat process {pid} has no stdin"))?;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .with_context(|| format!("write to chat process {pid} failed"))?;
        stdin.flush().await.ok();
        Ok(())
    }

    /// 终止进程。退出事件由监护任务统一上报。
    pub(crate) fn kill(&mut self, pid: u32) -> anyhow::Result<()> {
        let handle = self
            .children
            .get_mut(&pid)
            .ok_or_else(|| anyhow!("no chat process with pid {pid}"))?;
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    /// 进程退出后的登记清理（由主循环在收到 Exited 事件时调用）。
    pub(crate) fn forget(&mut self, pid: u32) {
        self.children.remove(&pid);
    }

    /// 停止全部进程（进程退出收尾）。
    pub(crate) fn abort_all(&mut self) {
        for (_, mut handle) in self.children.drain() {
            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }
}

/// 行读取任务：把子进程输出逐行转成事件。
fn spawn_line_reader(
    pid: u32,
    stream: &'static str,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    event_tx: mpsc::UnboundedSender<ChatEvent>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if event_tx
                .send(ChatEvent::Output { pid, stream, line })
                .is_err()
            {
                break;
            }
        }
    });
}

/// 监护任务：持有 Child，等待退出或收到 kill 指令。
fn spawn_supervisor(
    pid: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    event_tx: mpsc::UnboundedSender<ChatEvent>,
) {
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => status.ok().and_then(|s| s.code()),
            _ = kill_rx => {
                if let Err(err) = child.kill().await {
                    warn!("kill chat process {pid} failed: {err}");
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };
        let _ = event_tx.send(ChatEvent::Exited { pid, code });
    });
}
