//! 更新引擎模块
//!
//! 包含热更新机制的全部组件：
//! - 生命周期状态机与阻塞加载跟踪
//! - 更新清单、更新源与扩展点
//! - 受影响模块分析器与提交计划编排
//! - 引擎本体与模块执行上下文

pub mod blocking;
pub mod context;
pub mod effects;
pub mod engine;
pub mod manifest;
pub mod options;
pub mod plan;
pub mod status;

// 重导出常用类型
pub use blocking::BlockingTracker;
pub use context::ModuleContext;
pub use effects::{affected_module_effects, EffectResult};
pub use engine::HotSwapEngine;
pub use manifest::{
    module_factory, CollectorWork, InvalidationHandler, ModuleChange, ModuleFactory,
    QueuedUpdateSource, RuntimeInitializer, UpdateCollector, UpdateManifest, UpdateSource,
};
pub use options::{ApplyOptions, EffectCallback, ErrorEvent, ErrorEventKind, ErroredCallback};
pub use plan::PendingUpdate;
pub use status::{PhaseListener, StatusBus, UpdatePhase};
