//! 远程控制状态机模块职责：
//! 1. 维护 local / remote / unlocking 三态与接管宽限计时。
//! 2. 校验解锁密码并给出需要回发的控制信号。
//! 3. 对端离线、配对解除或断线时自动回到 local。

use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::config::is_valid_unlock_secret;

/// 控制策略：是否允许接管、解锁密码、接管宽限。
#[derive(Debug, Clone)]
pub(crate) struct ControlPolicy {
    pub(crate) allow_remote_control: bool,
    pub(crate) unlock_secret: String,
    /// 0 表示立即接管。
    pub(crate) auto_lock_timeout: Duration,
}

/// 控制状态。
#[derive(Debug, Clone)]
enum ControlState {
    Local,
    Remote {
        controller: String,
        controller_name: String,
        entered_at: Instant,
    },
    Unlocking {
        controller: String,
        controller_name: String,
    },
}

/// 待生效的接管（宽限计时中）。
#[derive(Debug, Clone)]
struct PendingGrant {
    controller: String,
    controller_name: String,
    deadline: Instant,
}

/// 控制请求的裁决。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ControlDecision {
    /// 已接受；`immediate` 为 false 时等待宽限计时到点。
    Accepted { immediate: bool },
    Denied,
}

/// 解锁尝试结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UnlockOutcome {
    /// 解锁成功，应向 controller 发送 control-revoked。
    Unlocked { controller: String },
    WrongSecret,
    NotLocked,
}

/// 远程控制状态机。单线程持有，全部状态变更都走显式方法。
pub(crate) struct RemoteControl {
    policy: ControlPolicy,
    state: ControlState,
    pending: Option<PendingGrant>,
}

impl RemoteControl {
    pub(crate) fn new(policy: ControlPolicy) -> Self {
        Self {
            policy,
            state: ControlState::Local,
            pending: None,
        }
    }

    /// 是否处于锁定态（remote 或 unlocking）。
    pub(crate) fn is_locked(&self) -> bool {
        !matches!(self.state, ControlState::Local)
    }

    /// 当前控制端。
    pub(crate) fn controller(&self) -> Option<&str> {
        match &self.state {
            ControlState::Local => None,
            ControlState::Remote { controller, .. }
            | ControlState::Unlocking { controller, .. } => Some(controller),
        }
    }

    pub(crate) fn policy(&self) -> &ControlPolicy {
        &self.policy
    }

    /// 处理控制请求。策略关闭、无会话、已锁定或已有待接管均拒绝。
    pub(crate) fn on_control_request(
        &mut self,
        from: &str,
        from_name: &str,
        has_session: bool,
        now: Instant,
    ) -> ControlDecision {
        if !self.policy.allow_remote_control
            || !has_session
            || self.is_locked()
            || self.pending.is_some()
        {
            return ControlDecision::Denied;
        }

        if self.policy.auto_lock_timeout.is_zero() {
            self.state = ControlState::Remote {
                controller: from.to_string(),
                controller_name: from_name.to_string(),
                entered_at: now,
            };
            ControlDecision::Accepted { immediate: true }
        } else {
            self.pending = Some(PendingGrant {
                controller: from.to_string(),
                controller_name: from_name.to_string(),
                deadline: now + self.policy.auto_lock_timeout,
            });
            ControlDecision::Accepted { immediate: false }
        }
    }

    /// 宽限计时的下一个到点。
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// 宽限到点：正式进入 remote。返回是否发生切换。
    pub(crate) fn on_deadline(&mut self, now: Instant) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        self.state = ControlState::Remote {
            controller: pending.controller,
            controller_name: pending.controller_name,
            entered_at: now,
        };
        true
    }

    /// 尝试解锁。密码错误进入（或停留在）unlocking。
    pub(crate) fn try_unlock(&mut self, secret: &str) -> UnlockOutcome {
        let (controller, controller_name) = match &self.state {
            ControlState::Local => return UnlockOutcome::NotLocked,
            ControlState::Remote {
                controller,
                controller_name,
                ..
            }
            | ControlState::Unlocking {
                controller,
                controller_name,
            } => (controller.clone(), controller_name.clone()),
        };

        if secret == self.policy.unlock_secret {
            self.state = ControlState::Local;
            UnlockOutcome::Unlocked { controller }
        } else {
            self.state = ControlState::Unlocking {
                controller,
                controller_name,
            };
            UnlockOutcome::WrongSecret
        }
    }

    /// 对端离线 / 配对解除 / 对端主动释放：匹配的控制端即回到 local。
    /// 同时取消匹配的待接管计时。返回是否因此回到 local。
    pub(crate) fn peer_lost(&mut self, device_id: &str) -> bool {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.controller == device_id)
        {
            self.pending = None;
        }
        match self.controller() {
            Some(controller) if controller == device_id => {
                self.state = ControlState::Local;
                true
            }
            _ => false,
        }
    }

    /// relay 断线：控制端必然不可达，回到 local。
    pub(crate) fn connection_lost(&mut self) -> bool {
        self.pending = None;
        if self.is_locked() {
            self.state = ControlState::Local;
            return true;
        }
        false
    }

    /// 更新解锁密码；非六位数字拒绝。
    pub(crate) fn set_unlock_secret(&mut self, secret: &str) -> Result<(), String> {
        if !is_valid_unlock_secret(secret) {
            return Err("解锁密码必须是六位数字".to_string());
        }
        self.policy.unlock_secret = secret.to_string();
        Ok(())
    }

    pub(crate) fn set_allow_remote_control(&mut self, allow: bool) {
        self.policy.allow_remote_control = allow;
    }

    pub(crate) fn set_auto_lock_timeout(&mut self, timeout: Duration) {
        self.policy.auto_lock_timeout = timeout;
    }

    /// 管理端口用的状态快照。
    pub(crate) fn snapshot(&self) -> Value {
        let (state, controller, controller_name) = match &self.state {
            ControlState::Local => ("local", None, None),
            ControlState::Remote {
                controller,
                controller_name,
                ..
            } => ("remote", Some(controller.clone()), Some(controller_name.clone())),
            ControlState::Unlocking {
                controller,
                controller_name,
            } => (
                "unlocking",
                Some(controller.clone()),
                Some(controller_name.clone()),
            ),
        };
        json!({
            "state": state,
            "locked": self.is_locked(),
            "controller": controller,
            "controllerName": controller_name,
            "allowRemoteControl": self.policy.allow_remote_control,
            "autoLockTimeoutMs": self.policy.auto_lock_timeout.as_millis() as u64,
            "pendingGrant": self.pending.is_some(),
        })
    }
}
