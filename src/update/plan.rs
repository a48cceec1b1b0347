//! 更新编排：待应用更新累加器与提交计划
//!
//! 编排器对清单中的每个 ID 运行影响分析器，把结果合并为一份
//! 两阶段（销毁、应用）提交计划。任何结构性拒绝在默认策略下使
//! 整轮失败，不产生任何副作用。

use std::collections::{HashMap, HashSet};

use super::effects::{affected_module_effects, EffectResult};
use super::manifest::{
    FactorySlot, ModuleChange, ModuleFactory, RuntimeInitializer, UpdateManifest,
};
use crate::module::{ModuleRegistry, SelfErrorHandler};
use crate::utils::{Result, SwapError};

/// 待应用更新累加器
///
/// 按顺序收集本轮要处理的模块条目（新工厂或移除标记），来源包括
/// 更新清单和失效处理器。同一 ID 采用并集语义：先写入者生效。
#[derive(Default)]
pub struct PendingUpdate {
    /// 有序条目：模块 ID -> 新工厂（None 为移除标记）
    entries: Vec<(String, Option<ModuleFactory>)>,

    /// 本轮要清理的代码块 ID
    pub(crate) removed_chunks: Vec<String>,

    /// 本轮要执行的运行时初始化器
    pub(crate) runtime_initializers: Vec<RuntimeInitializer>,
}

impl PendingUpdate {
    /// 创建空的累加器
    pub fn new() -> Self {
        Self::default()
    }

    /// 从更新清单构建
    ///
    /// 移除标记先于变更模块写入，与原始清单的处理顺序一致。
    pub fn from_manifest(manifest: &UpdateManifest) -> Self {
        let mut pending = Self {
            removed_chunks: manifest.removed_chunks.clone(),
            runtime_initializers: manifest.runtime_initializers.clone(),
            ..Default::default()
        };
        for module_id in &manifest.removed_modules {
            pending.insert_tombstone(module_id);
        }
        for (module_id, change) in &manifest.changed_modules {
            match change {
                ModuleChange::Factory(factory) => {
                    pending.insert_factory(module_id, factory.clone());
                }
                ModuleChange::Removed => {
                    pending.insert_tombstone(module_id);
                }
            }
        }
        pending
    }

    /// 写入一个新工厂条目（已存在的 ID 保持不变）
    ///
    /// # Returns
    ///
    /// 条目是否被写入
    pub fn insert_factory(&mut self, module_id: &str, factory: ModuleFactory) -> bool {
        if self.contains(module_id) {
            return false;
        }
        self.entries.push((module_id.to_string(), Some(factory)));
        true
    }

    /// 写入一个移除标记（已存在的 ID 保持不变）
    pub fn insert_tombstone(&mut self, module_id: &str) -> bool {
        if self.contains(module_id) {
            return false;
        }
        self.entries.push((module_id.to_string(), None));
        true
    }

    /// 是否已包含指定模块
    pub fn contains(&self, module_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == module_id)
    }

    /// 并入另一份累加器
    ///
    /// 条目取并集（本方已有的 ID 保持不变），代码块与初始化器追加。
    pub fn merge(&mut self, other: PendingUpdate) {
        for (module_id, factory) in other.entries {
            match factory {
                Some(factory) => {
                    self.insert_factory(&module_id, factory);
                }
                None => {
                    self.insert_tombstone(&module_id);
                }
            }
        }
        for chunk_id in other.removed_chunks {
            if !self.removed_chunks.iter().any(|c| c == &chunk_id) {
                self.removed_chunks.push(chunk_id);
            }
        }
        self.runtime_initializers
            .extend(other.runtime_initializers);
    }

    /// 累加器是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 计划中一个待重新执行的自我接受 / 入口模块
pub(crate) struct SelfAcceptItem {
    pub module_id: String,
    /// 保留原有的入口标记，重新执行时原样传递
    pub main: bool,
    pub error_handler: Option<SelfErrorHandler>,
}

/// 两阶段提交计划
///
/// 销毁阶段消费 `outdated_modules` 与 `outdated_dependencies`；
/// 应用阶段安装 `applied_factories`、执行初始化器、调用接受回调并
/// 重新执行 `self_accept_queue`。
#[derive(Default)]
pub(crate) struct UpdatePlan {
    /// 应用阶段要安装的工厂槽位（移除的模块为哨兵）
    pub applied_factories: Vec<(String, FactorySlot)>,

    /// 需要销毁的模块，按发现顺序去重
    pub outdated_modules: Vec<String>,

    /// 接受方父模块 -> 其名下过期依赖（保持发现顺序）
    pub outdated_dependencies: Vec<(String, Vec<String>)>,

    /// 需要重新执行的自我接受 / 入口模块，按发现顺序
    pub self_accept_queue: Vec<SelfAcceptItem>,

    /// 要清理的代码块
    pub removed_chunks: Vec<String>,

    /// 要执行的运行时初始化器
    pub runtime_initializers: Vec<RuntimeInitializer>,

    /// 销毁阶段记录的各模块父列表，供重新执行时重新连接
    pub saved_parents: HashMap<String, Vec<String>>,

    /// 纯移除的模块（不重新执行）
    pub disposed_only: HashSet<String>,
}

impl UpdatePlan {
    /// 移除某个父模块名下的过期依赖条目
    pub fn remove_outdated_dependencies_of(&mut self, parent_id: &str) {
        self.outdated_dependencies.retain(|(id, _)| id != parent_id);
    }
}

/// 计划构建的产出
///
/// 通知与构建结果分离返回：调用方先释放注册表锁，再按顺序把
/// 通知交给本轮的回调。
pub(crate) struct PlanBuild {
    /// 按处理顺序产生的分类通知
    pub notifications: Vec<EffectResult>,
    /// 构建结果；结构性拒绝时为对应的中止错误
    pub result: Result<UpdatePlan>,
}

/// 计划构建用到的策略开关
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PlanPolicy {
    pub ignore_unaccepted: bool,
    pub ignore_declined: bool,
}

/// 去重追加
fn add_all_to_set(dst: &mut Vec<String>, src: &[String]) {
    for item in src {
        if !dst.iter().any(|existing| existing == item) {
            dst.push(item.clone());
        }
    }
}

/// 对一份待应用更新构建提交计划
///
/// 按条目顺序处理：移除标记直接产生 `Disposed` 效果，其余条目先
/// 经过影响分析器。结构性拒绝（除非被对应 ignore 开关降级）立即
/// 终止构建并返回中止错误，此时不会发生任何销毁或安装。
pub(crate) fn build_plan(
    registry: &ModuleRegistry,
    pending: PendingUpdate,
    policy: PlanPolicy,
) -> PlanBuild {
    let mut plan = UpdatePlan {
        removed_chunks: pending.removed_chunks,
        runtime_initializers: pending.runtime_initializers,
        ..Default::default()
    };
    let mut notifications = Vec::new();

    for (module_id, factory) in pending.entries {
        let result = match &factory {
            Some(_) => affected_module_effects(registry, &module_id),
            None => EffectResult::Disposed {
                module_id: module_id.clone(),
            },
        };

        match &result {
            EffectResult::SelfDeclined { module_id, chain } => {
                let error = SwapError::SelfDeclined {
                    module_id: module_id.clone(),
                    chain: chain.clone(),
                };
                notifications.push(result.clone());
                if !policy.ignore_declined {
                    return PlanBuild {
                        notifications,
                        result: Err(error),
                    };
                }
            }
            EffectResult::Declined {
                module_id,
                parent_id,
                chain,
            } => {
                let error = SwapError::Declined {
                    module_id: module_id.clone(),
                    parent_id: parent_id.clone(),
                    chain: chain.clone(),
                };
                notifications.push(result.clone());
                if !policy.ignore_declined {
                    return PlanBuild {
                        notifications,
                        result: Err(error),
                    };
                }
            }
            EffectResult::Unaccepted { module_id, chain } => {
                let error = SwapError::Unaccepted {
                    module_id: module_id.clone(),
                    chain: chain.clone(),
                };
                notifications.push(result.clone());
                if !policy.ignore_unaccepted {
                    return PlanBuild {
                        notifications,
                        result: Err(error),
                    };
                }
            }
            EffectResult::Accepted {
                outdated_modules,
                outdated_dependencies,
                ..
            } => {
                plan.applied_factories.push((
                    module_id.clone(),
                    FactorySlot::Active(factory.clone().expect("accepted 条目必有工厂")),
                ));
                add_all_to_set(&mut plan.outdated_modules, outdated_modules);
                for (parent_id, deps) in outdated_dependencies {
                    match plan
                        .outdated_dependencies
                        .iter_mut()
                        .find(|(id, _)| id == parent_id)
                    {
                        Some((_, existing)) => add_all_to_set(existing, deps),
                        None => plan
                            .outdated_dependencies
                            .push((parent_id.clone(), deps.clone())),
                    }
                }
                notifications.push(result.clone());
            }
            EffectResult::Disposed { .. } => {
                add_all_to_set(
                    &mut plan.outdated_modules,
                    std::slice::from_ref(&module_id),
                );
                plan.applied_factories
                    .push((module_id.clone(), FactorySlot::Removed));
                plan.disposed_only.insert(module_id.clone());
                notifications.push(result.clone());
            }
        }
    }

    // 收集需要重新执行的自我接受 / 入口模块（按发现顺序）
    for module_id in &plan.outdated_modules {
        // 被移除的模块不再重新执行
        if plan.disposed_only.contains(module_id) {
            continue;
        }
        let Some(record) = registry.get(module_id) else {
            continue;
        };
        // 调用过 invalidate 的模块无法自我接受
        if record.hot.self_invalidated {
            continue;
        }
        if record.hot.is_self_accepted() || record.hot.main {
            plan.self_accept_queue.push(SelfAcceptItem {
                module_id: module_id.clone(),
                main: record.hot.main,
                error_handler: record
                    .hot
                    .self_accepted
                    .as_ref()
                    .and_then(|spec| spec.error_handler()),
            });
        }
    }

    PlanBuild {
        notifications,
        result: Ok(plan),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{AcceptEntry, ModuleRecord, SelfAcceptSpec};
    use crate::update::manifest::module_factory;
    use serde_json::Value;
    use std::sync::Arc;

    fn dummy_factory() -> ModuleFactory {
        module_factory(|_ctx| async { Ok(Value::Null) })
    }

    fn build_registry(edges: &[(&str, &str)]) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for (parent, child) in edges {
            if !registry.contains(parent) {
                registry.install(ModuleRecord::new(*parent, false, None));
            }
            if !registry.contains(child) {
                registry.install(ModuleRecord::new(*child, false, None));
            }
            registry.add_edge(parent, child);
        }
        registry
    }

    fn accept(registry: &mut ModuleRegistry, parent: &str, dep: &str) {
        registry
            .get_mut(parent)
            .unwrap()
            .hot
            .accepted_dependencies
            .insert(
                dep.to_string(),
                AcceptEntry {
                    callback: Arc::new(|_| Ok(())),
                    error_handler: None,
                },
            );
    }

    #[test]
    fn test_pending_union_first_writer_wins() {
        let mut pending = PendingUpdate::new();
        assert!(pending.insert_factory("a", dummy_factory()));
        assert!(!pending.insert_tombstone("a"));
        assert!(pending.insert_tombstone("b"));
        assert!(!pending.insert_factory("b", dummy_factory()));

        assert_eq!(pending.len(), 2);
        assert!(pending.contains("a"));
        assert!(pending.contains("b"));
    }

    #[test]
    fn test_pending_from_manifest_order() {
        let manifest = UpdateManifest::new()
            .with_module("leaf", dummy_factory())
            .with_removed_module("legacy");
        let pending = PendingUpdate::from_manifest(&manifest);

        // 移除标记先写入
        assert_eq!(pending.entries[0].0, "legacy");
        assert!(pending.entries[0].1.is_none());
        assert_eq!(pending.entries[1].0, "leaf");
        assert!(pending.entries[1].1.is_some());
    }

    #[test]
    fn test_plan_accepted_merge() {
        let mut registry = build_registry(&[("mid", "leaf")]);
        accept(&mut registry, "mid", "leaf");

        let mut pending = PendingUpdate::new();
        pending.insert_factory("leaf", dummy_factory());

        let build = build_plan(&registry, pending, PlanPolicy::default());
        let plan = build.result.unwrap();

        assert_eq!(plan.outdated_modules, vec!["leaf"]);
        assert_eq!(plan.outdated_dependencies.len(), 1);
        assert_eq!(plan.outdated_dependencies[0].0, "mid");
        assert_eq!(plan.outdated_dependencies[0].1, vec!["leaf"]);
        assert_eq!(plan.applied_factories.len(), 1);
        assert_eq!(build.notifications.len(), 1);
        assert_eq!(build.notifications[0].kind(), "accepted");
    }

    #[test]
    fn test_plan_aborts_on_unaccepted() {
        let mut registry = build_registry(&[("main", "leaf")]);
        registry.get_mut("main").unwrap().hot.main = true;

        let mut pending = PendingUpdate::new();
        pending.insert_factory("leaf", dummy_factory());

        let build = build_plan(&registry, pending, PlanPolicy::default());
        assert!(matches!(build.result, Err(SwapError::Unaccepted { .. })));
        assert_eq!(build.notifications.len(), 1);
        assert_eq!(build.notifications[0].kind(), "unaccepted");
    }

    #[test]
    fn test_plan_ignore_unaccepted_drops_entry() {
        let mut registry = build_registry(&[("main", "leaf"), ("mid", "other")]);
        registry.get_mut("main").unwrap().hot.main = true;
        accept(&mut registry, "mid", "other");

        let mut pending = PendingUpdate::new();
        pending.insert_factory("leaf", dummy_factory());
        pending.insert_factory("other", dummy_factory());

        let policy = PlanPolicy {
            ignore_unaccepted: true,
            ignore_declined: false,
        };
        let build = build_plan(&registry, pending, policy);
        let plan = build.result.unwrap();

        // leaf 被丢弃，other 正常进入计划
        assert!(!plan
            .applied_factories
            .iter()
            .any(|(id, _)| id == "leaf"));
        assert!(plan.applied_factories.iter().any(|(id, _)| id == "other"));
        assert_eq!(build.notifications.len(), 2);
    }

    #[test]
    fn test_plan_disposed_tombstone() {
        let registry = build_registry(&[("mid", "leaf")]);

        let mut pending = PendingUpdate::new();
        pending.insert_tombstone("leaf");

        let build = build_plan(&registry, pending, PlanPolicy::default());
        let plan = build.result.unwrap();

        assert_eq!(plan.outdated_modules, vec!["leaf"]);
        assert!(plan.disposed_only.contains("leaf"));
        assert!(matches!(
            plan.applied_factories[0],
            (_, FactorySlot::Removed)
        ));
        assert!(plan.self_accept_queue.is_empty());
    }

    #[test]
    fn test_plan_collects_self_accepted() {
        let mut registry = build_registry(&[("top", "widget")]);
        registry.get_mut("widget").unwrap().hot.self_accepted = Some(SelfAcceptSpec::Bare);

        let mut pending = PendingUpdate::new();
        pending.insert_factory("widget", dummy_factory());

        let build = build_plan(&registry, pending, PlanPolicy::default());
        let plan = build.result.unwrap();

        assert_eq!(plan.self_accept_queue.len(), 1);
        assert_eq!(plan.self_accept_queue[0].module_id, "widget");
        assert!(!plan.self_accept_queue[0].main);
        assert!(plan.self_accept_queue[0].error_handler.is_none());
    }

    #[test]
    fn test_plan_declined_abort_and_ignore() {
        let mut registry = build_registry(&[("mid", "leaf")]);
        registry
            .get_mut("mid")
            .unwrap()
            .hot
            .declined_dependencies
            .insert("leaf".to_string());

        let mut pending = PendingUpdate::new();
        pending.insert_factory("leaf", dummy_factory());
        let build = build_plan(&registry, pending, PlanPolicy::default());
        assert!(matches!(build.result, Err(SwapError::Declined { .. })));

        let mut pending = PendingUpdate::new();
        pending.insert_factory("leaf", dummy_factory());
        let policy = PlanPolicy {
            ignore_unaccepted: false,
            ignore_declined: true,
        };
        let build = build_plan(&registry, pending, policy);
        let plan = build.result.unwrap();
        assert!(plan.applied_factories.is_empty());
    }
}
