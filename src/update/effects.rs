//! 受影响模块分析器
//!
//! 给定一个变更模块 ID，沿反向依赖边（从被依赖方到依赖方）向上
//! 遍历，对整个影响范围分类：哪些模块过期需要重建、哪些父模块
//! 通过 accept 在本层吸收了更新、以及更新在哪一点因拒绝或到达
//! 入口模块而无法安全完成。
//!
//! 遍历是基于工作列表的深度优先，依靠"已过期即跳过"守卫在
//! 循环依赖图上保证终止。

use std::collections::HashMap;

use crate::module::ModuleRegistry;

/// 单个变更模块的影响分析结果
///
/// `chain` 是从变更模块向上到失败点的有序传播路径，保留用于诊断。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectResult {
    /// 更新可以被安全吸收
    Accepted {
        /// 变更模块 ID
        module_id: String,
        /// 需要销毁并重建的模块（含变更模块自身），按发现顺序
        outdated_modules: Vec<String>,
        /// 通过 accept 吸收更新的父模块 -> 其名下过期依赖列表
        outdated_dependencies: HashMap<String, Vec<String>>,
    },
    /// 传播路径上的某个模块自我拒绝热替换
    SelfDeclined {
        module_id: String,
        chain: Vec<String>,
    },
    /// 某个父模块拒绝了该依赖的热替换
    Declined {
        module_id: String,
        parent_id: String,
        chain: Vec<String>,
    },
    /// 更新传播到入口模块仍未被接受
    Unaccepted {
        module_id: String,
        chain: Vec<String>,
    },
    /// 模块被移除，只需销毁
    Disposed { module_id: String },
}

impl EffectResult {
    /// 结果类别名称
    pub fn kind(&self) -> &'static str {
        match self {
            EffectResult::Accepted { .. } => "accepted",
            EffectResult::SelfDeclined { .. } => "self-declined",
            EffectResult::Declined { .. } => "declined",
            EffectResult::Unaccepted { .. } => "unaccepted",
            EffectResult::Disposed { .. } => "disposed",
        }
    }

    /// 传播路径（如有）
    pub fn chain(&self) -> Option<&[String]> {
        match self {
            EffectResult::SelfDeclined { chain, .. }
            | EffectResult::Declined { chain, .. }
            | EffectResult::Unaccepted { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

/// 工作列表中的一项
struct QueueItem {
    chain: Vec<String>,
    id: String,
}

/// 分析一个变更模块的完整影响范围
///
/// 算法（自下而上的工作列表遍历）：
///
/// 1. 以变更模块自身作为种子。
/// 2. 取出一项：未加载的模块直接跳过；自我接受（且未自我失效）的
///    模块终止该分支；自我拒绝返回 [`EffectResult::SelfDeclined`]；
///    入口模块返回 [`EffectResult::Unaccepted`]。
/// 3. 否则检查每个父模块：声明拒绝则返回 [`EffectResult::Declined`]；
///    已记为过期则跳过（循环守卫）；声明接受则记入过期依赖并停止
///    向上传播；其余父模块标记过期并继续入队。
/// 4. 队列耗尽且无中止时返回 [`EffectResult::Accepted`]。
///
/// 接受会严格截断向上传播：接受方自行负责重新渲染，它的父模块
/// 不会被连带触发。
pub fn affected_module_effects(registry: &ModuleRegistry, update_module_id: &str) -> EffectResult {
    let mut outdated_modules = vec![update_module_id.to_string()];
    let mut outdated_dependencies: HashMap<String, Vec<String>> = HashMap::new();

    let mut queue = vec![QueueItem {
        chain: vec![update_module_id.to_string()],
        id: update_module_id.to_string(),
    }];

    while let Some(item) = queue.pop() {
        let module_id = item.id;
        let chain = item.chain;

        let Some(module) = registry.get(&module_id) else {
            // 从未加载过的模块，这条分支无事可做
            continue;
        };

        if module.hot.is_self_accepted() && !module.hot.self_invalidated {
            continue;
        }

        if module.hot.self_declined {
            return EffectResult::SelfDeclined {
                module_id,
                chain,
            };
        }

        if module.hot.main {
            // 入口模块没有父模块可以继续吸收这次更新
            return EffectResult::Unaccepted {
                module_id,
                chain,
            };
        }

        for parent_id in &module.parents {
            let Some(parent) = registry.get(parent_id) else {
                continue;
            };

            if parent.hot.declines(&module_id) {
                let mut declined_chain = chain.clone();
                declined_chain.push(parent_id.clone());
                return EffectResult::Declined {
                    module_id,
                    parent_id: parent_id.clone(),
                    chain: declined_chain,
                };
            }

            // 循环守卫：已过期的父模块不再入队
            if outdated_modules.iter().any(|m| m == parent_id) {
                continue;
            }

            if parent.hot.accepts(&module_id) {
                let deps = outdated_dependencies
                    .entry(parent_id.clone())
                    .or_default();
                if !deps.iter().any(|d| d == &module_id) {
                    deps.push(module_id.clone());
                }
                continue;
            }

            // 父模块本身过期后，它之前以接受方身份记下的条目作废
            outdated_dependencies.remove(parent_id);
            outdated_modules.push(parent_id.clone());
            let mut parent_chain = chain.clone();
            parent_chain.push(parent_id.clone());
            queue.push(QueueItem {
                chain: parent_chain,
                id: parent_id.clone(),
            });
        }
    }

    EffectResult::Accepted {
        module_id: update_module_id.to_string(),
        outdated_modules,
        outdated_dependencies,
    }
}
