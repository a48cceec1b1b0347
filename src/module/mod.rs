//! 模块数据模型
//!
//! 包含模块注册表及其数据结构：
//! - 模块记录与依赖边
//! - 模块热状态（accept / decline / dispose 声明）

pub mod hot;
pub mod record;
pub mod registry;

// 重导出常用类型
pub use hot::{
    AcceptCallback, AcceptEntry, AcceptErrorContext, AcceptErrorHandler, CarryOverData,
    DisposeHandler, HotState, SelfAcceptSpec, SelfErrorContext, SelfErrorHandler,
};
pub use record::ModuleRecord;
pub use registry::ModuleRegistry;
