//! 模块注册表
//!
//! 持有所有当前已加载的模块记录及其依赖边。注册表只负责数据与
//! 双向边一致性，不包含任何更新策略；策略全部位于影响分析器和
//! 提交执行器中。

use std::collections::HashMap;

use super::record::ModuleRecord;

/// 模块注册表
///
/// 维护不变量：若 `A.children` 包含 `B` 且两者都在注册表中，
/// 则 `B.parents` 包含 `A`（销毁步骤进行中除外）。
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// 已加载的模块：module_id -> ModuleRecord
    modules: HashMap<String, ModuleRecord>,
}

impl ModuleRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取模块记录
    pub fn get(&self, module_id: &str) -> Option<&ModuleRecord> {
        self.modules.get(module_id)
    }

    /// 获取可变模块记录
    pub fn get_mut(&mut self, module_id: &str) -> Option<&mut ModuleRecord> {
        self.modules.get_mut(module_id)
    }

    /// 检查模块是否已加载
    pub fn contains(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    /// 安装模块记录
    ///
    /// 记录携带的父模块列表会被重新连接：每个仍然存活的父模块的
    /// `children` 中补齐本模块，保证双向一致。列表中已不存活的
    /// 父模块 ID 原样保留，不构成边。
    pub fn install(&mut self, record: ModuleRecord) {
        let id = record.id.clone();
        let parents = record.parents.clone();
        self.modules.insert(id.clone(), record);

        for parent_id in &parents {
            if let Some(parent) = self.modules.get_mut(parent_id) {
                parent.add_child(&id);
            }
        }
    }

    /// 移除模块记录并返回
    ///
    /// 只移除条目本身，不会触碰其他模块的边；调用方（销毁阶段）
    /// 负责解除反向边。
    pub fn remove(&mut self, module_id: &str) -> Option<ModuleRecord> {
        self.modules.remove(module_id)
    }

    /// 添加一条依赖边：`parent_id` 依赖 `child_id`
    ///
    /// 同时维护正反两个方向；任一端不存在时不做任何事。
    pub fn add_edge(&mut self, parent_id: &str, child_id: &str) {
        if !self.modules.contains_key(parent_id) || !self.modules.contains_key(child_id) {
            return;
        }
        if let Some(parent) = self.modules.get_mut(parent_id) {
            parent.add_child(child_id);
        }
        if let Some(child) = self.modules.get_mut(child_id) {
            child.add_parent(parent_id);
        }
    }

    /// 移除一条依赖边
    pub fn remove_edge(&mut self, parent_id: &str, child_id: &str) {
        if let Some(parent) = self.modules.get_mut(parent_id) {
            parent.remove_child(child_id);
        }
        if let Some(child) = self.modules.get_mut(child_id) {
            child.remove_parent(parent_id);
        }
    }

    /// 已加载模块数量
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// 注册表是否为空
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 所有已加载模块的 ID
    pub fn module_ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// 校验双向边一致性（仅在存活模块之间）
    ///
    /// 销毁步骤之外的任意时刻都应返回 true。
    pub fn edges_consistent(&self) -> bool {
        for (id, record) in &self.modules {
            for child_id in &record.children {
                if let Some(child) = self.modules.get(child_id) {
                    if !child.parents.iter().any(|p| p == id) {
                        return false;
                    }
                }
            }
            for parent_id in &record.parents {
                if let Some(parent) = self.modules.get(parent_id) {
                    if !parent.children.iter().any(|c| c == id) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ModuleRecord {
        ModuleRecord::new(id, false, None)
    }

    #[test]
    fn test_install_and_get() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));

        assert!(registry.contains("app"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("app").unwrap().id, "app");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_add_edge_bidirectional() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));
        registry.install(record("leaf"));

        registry.add_edge("app", "leaf");

        assert_eq!(registry.get("app").unwrap().children, vec!["leaf"]);
        assert_eq!(registry.get("leaf").unwrap().parents, vec!["app"]);
        assert!(registry.edges_consistent());
    }

    #[test]
    fn test_add_edge_missing_endpoint() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));

        registry.add_edge("app", "ghost");
        assert!(registry.get("app").unwrap().children.is_empty());
    }

    #[test]
    fn test_remove_edge() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));
        registry.install(record("leaf"));
        registry.add_edge("app", "leaf");

        registry.remove_edge("app", "leaf");

        assert!(registry.get("app").unwrap().children.is_empty());
        assert!(registry.get("leaf").unwrap().parents.is_empty());
        assert!(registry.edges_consistent());
    }

    #[test]
    fn test_install_relinks_live_parents() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("mid"));

        let mut leaf = record("leaf");
        leaf.add_parent("mid");
        leaf.add_parent("gone");
        registry.install(leaf);

        // 存活的父模块补齐了正向边，不存活的保留在 parents 中但不构成边
        assert_eq!(registry.get("mid").unwrap().children, vec!["leaf"]);
        assert_eq!(
            registry.get("leaf").unwrap().parents,
            vec!["mid", "gone"]
        );
        assert!(registry.edges_consistent());
    }

    #[test]
    fn test_remove_leaves_edges_to_caller() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));
        registry.install(record("leaf"));
        registry.add_edge("app", "leaf");

        let removed = registry.remove("leaf").unwrap();
        assert_eq!(removed.parents, vec!["app"]);
        // remove 本身不触碰 app 的边
        assert_eq!(registry.get("app").unwrap().children, vec!["leaf"]);
    }

    #[test]
    fn test_edges_consistent_detects_violation() {
        let mut registry = ModuleRegistry::new();
        registry.install(record("app"));
        let mut leaf = record("leaf");
        leaf.add_parent("app");
        // 绕过 install 的重连，直接插入一个只有单向边的记录
        registry.modules.insert("leaf".to_string(), leaf);
        registry.modules.get_mut("leaf").unwrap().remove_parent("app");
        registry
            .modules
            .get_mut("app")
            .unwrap()
            .add_child("leaf");

        assert!(!registry.edges_consistent());
    }
}
