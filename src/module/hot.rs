//! 模块热状态
//!
//! 每个已加载模块持有一份热状态，记录该模块对热替换的声明：
//! 接受（accept）、拒绝（decline）、销毁回调（dispose handler）以及
//! 来自上一代实例的交接数据。热状态由模块自身代码在执行期注册，
//! 由更新引擎在更新轮次中读取和销毁。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// 销毁回调接收的交接数据容器
pub type CarryOverData = serde_json::Map<String, Value>;

/// 依赖接受回调
///
/// 回调接收本轮中该父模块名下所有过期依赖的 ID 列表。
pub type AcceptCallback = Arc<dyn Fn(&[String]) -> anyhow::Result<()> + Send + Sync>;

/// 依赖接受回调的错误处理器
pub type AcceptErrorHandler =
    Arc<dyn Fn(&anyhow::Error, &AcceptErrorContext) -> anyhow::Result<()> + Send + Sync>;

/// 自我接受模块重新执行失败时的错误处理器
pub type SelfErrorHandler =
    Arc<dyn Fn(&anyhow::Error, &SelfErrorContext) -> anyhow::Result<()> + Send + Sync>;

/// 销毁回调
///
/// 在模块被销毁时按注册顺序调用，可向交接数据写入任意内容，
/// 替换实例通过 `hot.data` 读取。
pub type DisposeHandler = Arc<dyn Fn(&mut CarryOverData) + Send + Sync>;

/// 接受回调出错时的上下文
#[derive(Debug, Clone)]
pub struct AcceptErrorContext {
    /// 注册接受回调的父模块 ID
    pub module_id: String,
    /// 触发回调的依赖 ID
    pub dependency_id: String,
}

/// 自我接受模块出错时的上下文
#[derive(Debug, Clone)]
pub struct SelfErrorContext {
    /// 重新执行失败的模块 ID
    pub module_id: String,
}

/// 自我接受声明
///
/// 模块声明自己可以整体重新执行来吸收更新；可附带错误处理器。
#[derive(Clone)]
pub enum SelfAcceptSpec {
    /// 无错误处理器的自我接受
    Bare,
    /// 带错误处理器的自我接受
    WithHandler(SelfErrorHandler),
}

impl SelfAcceptSpec {
    /// 取出错误处理器（如有）
    pub fn error_handler(&self) -> Option<SelfErrorHandler> {
        match self {
            SelfAcceptSpec::Bare => None,
            SelfAcceptSpec::WithHandler(h) => Some(Arc::clone(h)),
        }
    }
}

impl fmt::Debug for SelfAcceptSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfAcceptSpec::Bare => write!(f, "SelfAcceptSpec::Bare"),
            SelfAcceptSpec::WithHandler(_) => write!(f, "SelfAcceptSpec::WithHandler(..)"),
        }
    }
}

/// 单个被接受依赖的登记项
#[derive(Clone)]
pub struct AcceptEntry {
    /// 更新回调
    pub callback: AcceptCallback,
    /// 可选的错误处理器
    pub error_handler: Option<AcceptErrorHandler>,
}

/// 模块热状态
///
/// 在模块首次执行时创建；`active` 置为 false 后任何注册操作都是错误。
pub struct HotState {
    /// 模块是否仍然存活；销毁后为 false
    pub active: bool,

    /// 自我接受声明
    pub self_accepted: Option<SelfAcceptSpec>,

    /// 模块是否声明自己禁止热替换
    pub self_declined: bool,

    /// 模块是否调用过 invalidate()
    pub self_invalidated: bool,

    /// 是否为入口模块（没有请求方的顶层执行）
    pub main: bool,

    /// 被接受的依赖：依赖 ID -> 登记项
    pub accepted_dependencies: HashMap<String, AcceptEntry>,

    /// 被拒绝的依赖 ID 集合
    pub declined_dependencies: HashSet<String>,

    /// 销毁回调，按注册顺序执行
    pub dispose_handlers: Vec<DisposeHandler>,

    /// 来自上一代实例的交接数据
    pub data: Option<Value>,
}

impl HotState {
    /// 创建新的热状态
    pub fn new(main: bool, data: Option<Value>) -> Self {
        Self {
            active: true,
            self_accepted: None,
            self_declined: false,
            self_invalidated: false,
            main,
            accepted_dependencies: HashMap::new(),
            declined_dependencies: HashSet::new(),
            dispose_handlers: Vec::new(),
            data,
        }
    }

    /// 模块是否自我接受
    pub fn is_self_accepted(&self) -> bool {
        self.self_accepted.is_some()
    }

    /// 模块是否接受了指定依赖
    pub fn accepts(&self, dependency_id: &str) -> bool {
        self.accepted_dependencies.contains_key(dependency_id)
    }

    /// 模块是否拒绝了指定依赖
    pub fn declines(&self, dependency_id: &str) -> bool {
        self.declined_dependencies.contains(dependency_id)
    }
}

impl fmt::Debug for HotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotState")
            .field("active", &self.active)
            .field("self_accepted", &self.self_accepted)
            .field("self_declined", &self.self_declined)
            .field("self_invalidated", &self.self_invalidated)
            .field("main", &self.main)
            .field(
                "accepted_dependencies",
                &self.accepted_dependencies.keys().collect::<Vec<_>>(),
            )
            .field("declined_dependencies", &self.declined_dependencies)
            .field("dispose_handlers", &self.dispose_handlers.len())
            .finish()
    }
}
