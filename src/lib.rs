//! # Chips Hotswap - 薯片热更新引擎
//!
//! 薯片生态的热更新引擎，在不重启进程的情况下安全替换运行中程序的
//! 模块图。核心能力：
//!
//! - **模块注册表**: 已加载模块及其双向依赖边的唯一事实来源
//! - **生命周期状态机**: `idle → check → prepare → ready → dispose → apply`
//!   的完整更新轮次，出错进入 `abort` / `fail` 后回到 `idle`
//! - **影响分析**: 对每个变更模块向上遍历依赖图，分类接受、拒绝、
//!   未接受与移除
//! - **两阶段提交**: 销毁完全先于安装，中止的轮次不产生任何副作用
//! - **可重入失效**: 提交进行中的 `invalidate()` 被排队，在引擎回到
//!   空闲之前自动消化
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_hotswap::{module_factory, ApplyOptions, HotSwapEngine, QueuedUpdateSource, UpdateManifest};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(QueuedUpdateSource::new());
//!     let engine = HotSwapEngine::new(source.clone());
//!
//!     // 定义并执行入口模块
//!     engine.define_module("app", module_factory(|ctx| async move {
//!         ctx.accept_self()?;
//!         Ok(serde_json::json!("v1"))
//!     }));
//!     engine.require("app").await?;
//!
//!     // 放入一份更新清单并走完一轮更新
//!     source.push(UpdateManifest::new().with_module(
//!         "app",
//!         module_factory(|ctx| async move {
//!             ctx.accept_self()?;
//!             Ok(serde_json::json!("v2"))
//!         }),
//!     ));
//!     engine.check().await?;
//!     let outdated = engine.apply(ApplyOptions::new()).await?;
//!     println!("已替换模块: {:?}", outdated);
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块注册表、记录与热状态
//! - `update` - 状态机、分析器、编排与引擎本体
//! - `core` - 引擎配置
//! - `utils` - 错误类型、日志系统、更新指标

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod module;
pub mod update;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    AcceptCallback, AcceptErrorContext, AcceptErrorHandler, CarryOverData, DisposeHandler,
    HotState, ModuleRecord, ModuleRegistry, SelfAcceptSpec, SelfErrorContext, SelfErrorHandler,
};

pub use update::{
    affected_module_effects, module_factory, ApplyOptions, BlockingTracker, EffectResult,
    HotSwapEngine, InvalidationHandler, ModuleChange, ModuleContext, ModuleFactory,
    PendingUpdate, PhaseListener, QueuedUpdateSource, RuntimeInitializer, UpdateCollector,
    UpdateManifest, UpdatePhase, UpdateSource,
};

pub use core::config::{EngineConfig, EngineConfigBuilder, LogConfig, UpdatePolicy};

pub use utils::{
    error_code, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, Result, RotationStrategy,
    SwapError, UpdateMetricsSnapshot,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
