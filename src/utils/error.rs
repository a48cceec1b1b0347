//! 热更新引擎错误类型定义
//!
//! 本模块定义了引擎中使用的所有错误类型。

use thiserror::Error;

use crate::update::status::UpdatePhase;

/// 热更新引擎核心错误类型
#[derive(Error, Debug)]
pub enum SwapError {
    // ==================== 状态机错误 ====================

    /// 当前阶段不允许执行该操作
    #[error("{operation} 不允许在 {actual} 阶段调用")]
    InvalidPhase {
        operation: &'static str,
        actual: UpdatePhase,
    },

    /// 没有待应用的更新
    #[error("没有待应用的更新")]
    NothingPending,

    /// 失效排空轮次超出上限
    #[error("更新轮次超出上限 ({0})，可能存在反复自我失效的模块")]
    RoundLimitExceeded(usize),

    // ==================== 更新传播错误 ====================

    /// 变更模块自我拒绝热替换，整轮更新中止
    #[error("更新中止: 模块 '{module_id}' 自我拒绝热替换 (传播路径: {})", .chain.join(" -> "))]
    SelfDeclined {
        module_id: String,
        chain: Vec<String>,
    },

    /// 父模块拒绝了该依赖的热替换，整轮更新中止
    #[error("更新中止: 模块 '{parent_id}' 拒绝了依赖 '{module_id}' 的热替换 (传播路径: {})", .chain.join(" -> "))]
    Declined {
        module_id: String,
        parent_id: String,
        chain: Vec<String>,
    },

    /// 更新传播到入口模块仍未被接受，整轮更新中止
    #[error("更新中止: 模块 '{module_id}' 的变更未被任何模块接受 (传播路径: {})", .chain.join(" -> "))]
    Unaccepted {
        module_id: String,
        chain: Vec<String>,
    },

    // ==================== 模块与注册表错误 ====================

    /// 模块未注册任何工厂
    #[error("模块 '{0}' 没有已注册的工厂")]
    FactoryMissing(String),

    /// 模块已从程序中移除
    #[error("模块 '{0}' 已从程序中移除，无法再被加载")]
    ModuleRemoved(String),

    /// 模块已被销毁，禁止继续操作其热状态
    #[error("模块 '{0}' 已被销毁，禁止继续操作其热状态")]
    ModuleDisposed(String),

    /// 模块执行失败
    #[error("模块 '{module_id}' 执行失败")]
    Execution {
        module_id: String,
        #[source]
        source: anyhow::Error,
    },

    // ==================== 更新源与准备阶段错误 ====================

    /// 准备阶段的异步加载工作失败
    #[error("准备阶段失败: {0}")]
    PrepareFailed(String),

    // ==================== 观察者错误 ====================

    /// 状态订阅未找到
    #[error("状态订阅未找到: '{0}'")]
    ListenerNotFound(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 引擎操作结果类型别名
pub type Result<T> = std::result::Result<T, SwapError>;

/// 错误码常量
pub mod error_code {
    // 状态机错误 (PHASE-xxx)
    pub const PHASE_INVALID: &str = "PHASE-001";
    pub const PHASE_NOTHING_PENDING: &str = "PHASE-002";
    pub const PHASE_ROUND_LIMIT: &str = "PHASE-003";

    // 传播错误 (PROPAGATE-xxx)
    pub const PROPAGATE_SELF_DECLINED: &str = "PROPAGATE-001";
    pub const PROPAGATE_DECLINED: &str = "PROPAGATE-002";
    pub const PROPAGATE_UNACCEPTED: &str = "PROPAGATE-003";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_FACTORY_MISSING: &str = "MODULE-001";
    pub const MODULE_REMOVED: &str = "MODULE-002";
    pub const MODULE_DISPOSED: &str = "MODULE-003";
    pub const MODULE_EXECUTION_ERROR: &str = "MODULE-004";

    // 更新源错误 (SOURCE-xxx)
    pub const SOURCE_PREPARE_FAILED: &str = "SOURCE-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl SwapError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            SwapError::InvalidPhase { .. } => error_code::PHASE_INVALID,
            SwapError::NothingPending => error_code::PHASE_NOTHING_PENDING,
            SwapError::RoundLimitExceeded(_) => error_code::PHASE_ROUND_LIMIT,
            SwapError::SelfDeclined { .. } => error_code::PROPAGATE_SELF_DECLINED,
            SwapError::Declined { .. } => error_code::PROPAGATE_DECLINED,
            SwapError::Unaccepted { .. } => error_code::PROPAGATE_UNACCEPTED,
            SwapError::FactoryMissing(_) => error_code::MODULE_FACTORY_MISSING,
            SwapError::ModuleRemoved(_) => error_code::MODULE_REMOVED,
            SwapError::ModuleDisposed(_) => error_code::MODULE_DISPOSED,
            SwapError::Execution { .. } => error_code::MODULE_EXECUTION_ERROR,
            SwapError::PrepareFailed(_) => error_code::SOURCE_PREPARE_FAILED,
            SwapError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            SwapError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 是否为结构性中止错误（拒绝/未接受），区别于执行期错误
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            SwapError::SelfDeclined { .. }
                | SwapError::Declined { .. }
                | SwapError::Unaccepted { .. }
        )
    }
}
