//! 单轮更新的应用选项
//!
//! 控制结构性中止条件的忽略开关，以及每轮更新的可选回调通知。

use std::fmt;
use std::sync::Arc;

use super::effects::EffectResult;
use crate::core::config::UpdatePolicy;

/// 影响分析结果回调
pub type EffectCallback = Arc<dyn Fn(&EffectResult) + Send + Sync>;

/// 执行错误回调
pub type ErroredCallback = Arc<dyn Fn(&ErrorEvent<'_>) + Send + Sync>;

/// 执行错误事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEventKind {
    /// 接受回调抛出错误
    AcceptErrored,
    /// 接受回调的错误处理器自身抛出错误
    AcceptErrorHandlerErrored,
    /// 自我接受模块重新执行失败
    SelfAcceptErrored,
    /// 自我接受模块的错误处理器自身抛出错误
    SelfAcceptErrorHandlerErrored,
}

/// 执行错误事件
///
/// 通过 [`ApplyOptions::on_errored`] 通知调用方；错误以借用形式
/// 暴露，事件只在回调执行期间有效。
pub struct ErrorEvent<'a> {
    /// 事件类别
    pub kind: ErrorEventKind,
    /// 出错的模块 ID
    pub module_id: &'a str,
    /// 触发接受回调的依赖 ID（自我接受事件为 None）
    pub dependency_id: Option<&'a str>,
    /// 错误本身（处理器出错时为处理器的错误）
    pub error: &'a anyhow::Error,
    /// 处理器出错时的原始错误
    pub original_error: Option<&'a anyhow::Error>,
}

impl fmt::Debug for ErrorEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorEvent")
            .field("kind", &self.kind)
            .field("module_id", &self.module_id)
            .field("dependency_id", &self.dependency_id)
            .field("error", &format_args!("{}", self.error))
            .finish()
    }
}

/// 应用选项
///
/// 三个 ignore 开关分别把对应类别的中止条件降级为"丢弃该模块，
/// 继续处理"。回调用于观察本轮更新的分类结果与执行错误。
#[derive(Clone, Default)]
pub struct ApplyOptions {
    /// 忽略未被接受的变更
    pub ignore_unaccepted: bool,

    /// 忽略被拒绝的变更（self-declined 与 declined）
    pub ignore_declined: bool,

    /// 忽略应用阶段的执行错误
    pub ignore_errored: bool,

    /// 变更被接受时的通知
    pub on_accepted: Option<EffectCallback>,

    /// 变更被拒绝时的通知
    pub on_declined: Option<EffectCallback>,

    /// 变更未被接受时的通知
    pub on_unaccepted: Option<EffectCallback>,

    /// 模块被移除时的通知
    pub on_disposed: Option<EffectCallback>,

    /// 执行错误通知
    pub on_errored: Option<ErroredCallback>,
}

impl ApplyOptions {
    /// 创建默认选项（所有中止条件生效，无回调）
    pub fn new() -> Self {
        Self::default()
    }

    /// 从配置的更新策略创建
    pub fn from_policy(policy: &UpdatePolicy) -> Self {
        Self {
            ignore_unaccepted: policy.ignore_unaccepted,
            ignore_declined: policy.ignore_declined,
            ignore_errored: policy.ignore_errored,
            ..Default::default()
        }
    }

    /// 忽略未被接受的变更
    pub fn ignore_unaccepted(mut self) -> Self {
        self.ignore_unaccepted = true;
        self
    }

    /// 忽略被拒绝的变更
    pub fn ignore_declined(mut self) -> Self {
        self.ignore_declined = true;
        self
    }

    /// 忽略应用阶段的执行错误
    pub fn ignore_errored(mut self) -> Self {
        self.ignore_errored = true;
        self
    }

    /// 设置接受通知回调
    pub fn on_accepted(mut self, callback: EffectCallback) -> Self {
        self.on_accepted = Some(callback);
        self
    }

    /// 设置拒绝通知回调
    pub fn on_declined(mut self, callback: EffectCallback) -> Self {
        self.on_declined = Some(callback);
        self
    }

    /// 设置未接受通知回调
    pub fn on_unaccepted(mut self, callback: EffectCallback) -> Self {
        self.on_unaccepted = Some(callback);
        self
    }

    /// 设置移除通知回调
    pub fn on_disposed(mut self, callback: EffectCallback) -> Self {
        self.on_disposed = Some(callback);
        self
    }

    /// 设置执行错误通知回调
    pub fn on_errored(mut self, callback: ErroredCallback) -> Self {
        self.on_errored = Some(callback);
        self
    }
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("ignore_unaccepted", &self.ignore_unaccepted)
            .field("ignore_declined", &self.ignore_declined)
            .field("ignore_errored", &self.ignore_errored)
            .finish()
    }
}
