//! 模块执行上下文
//!
//! 工厂执行时拿到的句柄：通过它 require 依赖（同时登记依赖边）、
//! 注册热状态声明（accept / decline / dispose）以及请求失效。
//! 对应注册表里该模块自己的记录；模块销毁后句柄上的注册操作
//! 都会失败。

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::engine::HotSwapEngine;
use super::status::UpdatePhase;
use crate::module::{
    AcceptCallback, AcceptEntry, AcceptErrorHandler, DisposeHandler, HotState, SelfAcceptSpec,
    SelfErrorHandler,
};
use crate::utils::{Result, SwapError};

/// 模块执行上下文
///
/// 可廉价克隆并移入异步块；工厂通常把它捕获进自己的 Future。
#[derive(Clone)]
pub struct ModuleContext {
    engine: HotSwapEngine,
    module_id: String,
}

impl ModuleContext {
    /// 创建上下文（由引擎的模块激活路径调用）
    pub(crate) fn new(engine: HotSwapEngine, module_id: String) -> Self {
        Self { engine, module_id }
    }

    /// 本模块 ID
    pub fn id(&self) -> &str {
        &self.module_id
    }

    /// 引擎当前的生命周期阶段
    pub fn status(&self) -> UpdatePhase {
        self.engine.status()
    }

    /// 上一代实例销毁时留下的交接数据
    pub fn data(&self) -> Option<Value> {
        self.engine.with_state(|state| {
            state
                .registry
                .get(&self.module_id)
                .and_then(|record| record.hot.data.clone())
        })
    }

    /// 加载依赖并返回其导出值，同时登记依赖边
    ///
    /// 未加载的依赖会被立即执行。来自已销毁模块的 require 只记
    /// 警告并执行一次不登记边的加载。
    pub async fn require(&self, request: &str) -> Result<Value> {
        let requester_active = self.engine.with_state(|state| {
            state
                .registry
                .get(&self.module_id)
                .map(|record| record.hot.active)
                .unwrap_or(false)
        });

        if !requester_active {
            warn!(
                module_id = %self.module_id,
                request = %request,
                "来自已销毁模块的 require"
            );
            return self.engine.execute_module(request, Vec::new(), false).await;
        }

        // 已加载的依赖：补边并返回缓存
        let cached = self.engine.with_state(|state| {
            if state.registry.contains(request) {
                state.registry.add_edge(&self.module_id, request);
                state
                    .registry
                    .get(request)
                    .map(|record| record.exports.clone())
            } else {
                None
            }
        });
        if let Some(exports) = cached {
            return Ok(exports);
        }

        self.engine
            .execute_module(request, vec![self.module_id.clone()], true)
            .await
    }

    /// 接受指定依赖的更新
    ///
    /// 依赖变更时本模块不会被销毁，改由 `callback` 负责消化更新；
    /// 回调收到本轮该模块名下所有过期依赖的 ID 列表。
    pub fn accept(&self, dependencies: &[&str], callback: AcceptCallback) -> Result<()> {
        self.accept_entry(dependencies, callback, None)
    }

    /// 接受指定依赖的更新，并附带错误处理器
    pub fn accept_with(
        &self,
        dependencies: &[&str],
        callback: AcceptCallback,
        error_handler: AcceptErrorHandler,
    ) -> Result<()> {
        self.accept_entry(dependencies, callback, Some(error_handler))
    }

    fn accept_entry(
        &self,
        dependencies: &[&str],
        callback: AcceptCallback,
        error_handler: Option<AcceptErrorHandler>,
    ) -> Result<()> {
        self.with_active_hot(|hot| {
            for dependency in dependencies {
                hot.accepted_dependencies.insert(
                    (*dependency).to_string(),
                    AcceptEntry {
                        callback: Arc::clone(&callback),
                        error_handler: error_handler.clone(),
                    },
                );
            }
        })
    }

    /// 声明本模块可以整体重新执行来吸收更新
    pub fn accept_self(&self) -> Result<()> {
        self.with_active_hot(|hot| {
            hot.self_accepted = Some(SelfAcceptSpec::Bare);
        })
    }

    /// 声明自我接受，并附带重新执行失败时的错误处理器
    pub fn accept_self_with(&self, error_handler: SelfErrorHandler) -> Result<()> {
        self.with_active_hot(|hot| {
            hot.self_accepted = Some(SelfAcceptSpec::WithHandler(error_handler));
        })
    }

    /// 拒绝指定依赖的热替换
    ///
    /// 这些依赖的变更传播到本模块时整轮更新中止。
    pub fn decline(&self, dependencies: &[&str]) -> Result<()> {
        self.with_active_hot(|hot| {
            for dependency in dependencies {
                hot.declined_dependencies.insert((*dependency).to_string());
            }
        })
    }

    /// 声明本模块禁止热替换
    pub fn decline_self(&self) -> Result<()> {
        self.with_active_hot(|hot| {
            hot.self_declined = true;
        })
    }

    /// 注册销毁回调
    ///
    /// 模块销毁时按注册顺序执行，可向交接数据写入任意内容。
    pub fn on_dispose(&self, handler: DisposeHandler) -> Result<()> {
        self.with_active_hot(|hot| {
            hot.dispose_handlers.push(handler);
        })
    }

    /// 按标识移除已注册的销毁回调
    pub fn remove_dispose_handler(&self, handler: &DisposeHandler) -> Result<()> {
        self.with_active_hot(|hot| {
            hot.dispose_handlers
                .retain(|existing| !Arc::ptr_eq(existing, handler));
        })
    }

    /// 将本模块标记为失效
    ///
    /// 任何阶段都可以调用；提交进行中时请求被排队，稍后自动消费。
    pub fn invalidate(&self) {
        self.engine.invalidate(&self.module_id);
    }

    /// 在本模块存活的热状态上执行闭包
    fn with_active_hot<R>(&self, f: impl FnOnce(&mut HotState) -> R) -> Result<R> {
        self.engine.with_state(|state| {
            let record = state
                .registry
                .get_mut(&self.module_id)
                .ok_or_else(|| SwapError::ModuleDisposed(self.module_id.clone()))?;
            if !record.hot.active {
                return Err(SwapError::ModuleDisposed(self.module_id.clone()));
            }
            Ok(f(&mut record.hot))
        })
    }
}
