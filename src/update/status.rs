//! 更新生命周期状态机
//!
//! 跟踪引擎当前所处的阶段，并在每次转移时同步通知所有观察者。
//! 观察者通知发生在该阶段的实际工作开始之前，是引擎对外唯一的
//! 事件通道。

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::utils::{generate_id, Result, SwapError};

/// 更新生命周期阶段
///
/// 正常流转：`Idle → Check → Prepare → Ready → Dispose → Apply → Idle`。
/// `Abort` 与 `Fail` 是出错时的终止阶段，通知观察者后回到 `Idle`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    /// 空闲，可发起检查
    #[default]
    Idle,
    /// 正在向更新源查询清单
    Check,
    /// 正在等待收集器的异步加载工作
    Prepare,
    /// 更新就绪，等待应用
    Ready,
    /// 销毁阶段：拆除过期模块
    Dispose,
    /// 应用阶段：安装新工厂并重新激活
    Apply,
    /// 提交前中止（结构性拒绝），无任何副作用
    Abort,
    /// 应用阶段出错
    Fail,
}

impl UpdatePhase {
    /// 阶段名称
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Check => "check",
            UpdatePhase::Prepare => "prepare",
            UpdatePhase::Ready => "ready",
            UpdatePhase::Dispose => "dispose",
            UpdatePhase::Apply => "apply",
            UpdatePhase::Abort => "abort",
            UpdatePhase::Fail => "fail",
        }
    }

    /// 是否为出错终止阶段
    pub fn is_error(&self) -> bool {
        matches!(self, UpdatePhase::Abort | UpdatePhase::Fail)
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 阶段转移回调
pub type PhaseListener = Arc<dyn Fn(UpdatePhase) + Send + Sync>;

/// 内部订阅条目
struct ListenerEntry {
    subscription_id: String,
    callback: PhaseListener,
}

/// 状态总线
///
/// 保存当前阶段和观察者列表。回调在转移时同步执行，执行期间
/// 不持有任何内部锁，因此回调可以安全地回查引擎状态。
#[derive(Default)]
pub struct StatusBus {
    phase: RwLock<UpdatePhase>,
    listeners: RwLock<Vec<ListenerEntry>>,
}

impl StatusBus {
    /// 创建新的状态总线，初始阶段为 `Idle`
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前阶段
    pub fn current(&self) -> UpdatePhase {
        *self.phase.read().unwrap()
    }

    /// 转移到新阶段并同步通知所有观察者
    pub fn transition(&self, next: UpdatePhase) {
        let previous = {
            let mut phase = self.phase.write().unwrap();
            let previous = *phase;
            *phase = next;
            previous
        };
        debug!(from = %previous, to = %next, "更新阶段转移");

        let snapshot: Vec<PhaseListener> = {
            let listeners = self.listeners.read().unwrap();
            listeners.iter().map(|e| Arc::clone(&e.callback)).collect()
        };
        for callback in snapshot {
            callback(next);
        }
    }

    /// 订阅阶段转移
    ///
    /// # Returns
    ///
    /// 订阅 ID，用于取消订阅
    pub fn subscribe(&self, callback: PhaseListener) -> String {
        let subscription_id = generate_id();
        let mut listeners = self.listeners.write().unwrap();
        listeners.push(ListenerEntry {
            subscription_id: subscription_id.clone(),
            callback,
        });
        trace!(subscription_id = %subscription_id, "注册状态观察者");
        subscription_id
    }

    /// 取消订阅
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut listeners = self.listeners.write().unwrap();
        let before = listeners.len();
        listeners.retain(|e| e.subscription_id != subscription_id);
        if listeners.len() == before {
            return Err(SwapError::ListenerNotFound(subscription_id.to_string()));
        }
        Ok(())
    }

    /// 当前观察者数量
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }
}
