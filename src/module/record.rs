//! 模块记录
//!
//! 注册表中一个已加载模块的完整表示：导出值、双向依赖边和热状态。

use std::fmt;

use serde_json::Value;

use super::hot::HotState;

/// 模块记录
///
/// 边的方向约定：`children` 是本模块依赖的模块（正向边），
/// `parents` 是依赖本模块的模块（反向边）。两者都是保持插入顺序的
/// 去重列表，由注册表维护双向一致性。
pub struct ModuleRecord {
    /// 模块唯一标识
    pub id: String,

    /// 执行工厂产生的导出值
    pub exports: Value,

    /// 依赖本模块的模块 ID 列表
    pub parents: Vec<String>,

    /// 本模块依赖的模块 ID 列表
    pub children: Vec<String>,

    /// 热状态
    pub hot: HotState,
}

impl ModuleRecord {
    /// 创建新的模块记录
    pub fn new(id: impl Into<String>, main: bool, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            exports: Value::Null,
            parents: Vec::new(),
            children: Vec::new(),
            hot: HotState::new(main, data),
        }
    }

    /// 添加父模块（去重）
    pub fn add_parent(&mut self, parent_id: &str) {
        if !self.parents.iter().any(|p| p == parent_id) {
            self.parents.push(parent_id.to_string());
        }
    }

    /// 添加子模块（去重）
    pub fn add_child(&mut self, child_id: &str) {
        if !self.children.iter().any(|c| c == child_id) {
            self.children.push(child_id.to_string());
        }
    }

    /// 移除父模块
    pub fn remove_parent(&mut self, parent_id: &str) {
        self.parents.retain(|p| p != parent_id);
    }

    /// 移除子模块
    pub fn remove_child(&mut self, child_id: &str) {
        self.children.retain(|c| c != child_id);
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .field("hot", &self.hot)
            .finish()
    }
}
