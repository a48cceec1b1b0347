//! 更新指标收集
//!
//! 记录引擎各更新轮次的结果统计，供宿主程序查询和上报。

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 更新指标快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMetricsSnapshot {
    /// 成功应用的更新轮次数
    pub rounds_applied: u64,

    /// 因结构性拒绝而中止的轮次数
    pub rounds_aborted: u64,

    /// 因执行错误而失败的轮次数
    pub rounds_failed: u64,

    /// 累计被替换（销毁后重建或移除）的模块数
    pub modules_swapped: u64,

    /// 最后一次成功应用的时间
    pub last_applied_at: Option<DateTime<Utc>>,
}

/// 更新指标收集器
///
/// 内部使用读写锁保证线程安全，引擎在每轮更新结束时写入。
#[derive(Debug, Default)]
pub struct UpdateMetrics {
    inner: RwLock<UpdateMetricsSnapshot>,
}

impl UpdateMetrics {
    /// 创建新的指标收集器
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一轮成功应用的更新
    pub fn record_applied(&self, swapped_modules: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.rounds_applied += 1;
        inner.modules_swapped += swapped_modules as u64;
        inner.last_applied_at = Some(Utc::now());
    }

    /// 记录一轮被中止的更新
    pub fn record_aborted(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.rounds_aborted += 1;
    }

    /// 记录一轮失败的更新
    pub fn record_failed(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.rounds_failed += 1;
    }

    /// 获取当前指标快照
    pub fn snapshot(&self) -> UpdateMetricsSnapshot {
        self.inner.read().unwrap().clone()
    }
}
