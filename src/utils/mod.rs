//! 工具模块
//!
//! 包含错误类型、ID 生成、日志系统、更新指标等通用工具。

pub mod error;
pub mod id;
pub mod logger;
pub mod metrics;

// 重导出常用类型
pub use error::{error_code, Result, SwapError};
pub use id::{generate_id, is_valid_id};
pub use logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use metrics::{UpdateMetrics, UpdateMetricsSnapshot};
