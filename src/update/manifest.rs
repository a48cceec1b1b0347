//! 更新清单与更新源
//!
//! 更新清单由外部更新源（编译器 / 传输层）提供，描述一次变更集：
//! 新的模块工厂、被移除的模块与代码块，以及代码安装完成后需要
//! 执行的运行时初始化器。清单一经接收即不可变。

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::context::ModuleContext;
use super::plan::PendingUpdate;
use crate::utils::Result;

/// 模块工厂
///
/// 执行模块代码并产出导出值的异步可调用对象。工厂通过
/// [`ModuleContext`] 访问依赖、注册热状态声明。
pub type ModuleFactory =
    Arc<dyn Fn(ModuleContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// 运行时初始化器
///
/// 新代码安装完成后按顺序执行的不透明回调，用于重新注册
/// 横切的运行时钩子。
pub type RuntimeInitializer = Arc<dyn Fn() + Send + Sync>;

/// 准备阶段的一项异步加载工作
pub type CollectorWork = BoxFuture<'static, Result<()>>;

/// 更新收集器
///
/// 在 `prepare` 阶段被调用，可向共享的工作列表追加自己的异步
/// 加载任务（例如代码块拉取）。
pub type UpdateCollector = Arc<dyn Fn(&UpdateManifest, &mut Vec<CollectorWork>) + Send + Sync>;

/// 失效处理器
///
/// 模块失效（显式 `invalidate()` 或排空排队失效）时被调用，
/// 向待应用更新累加器贡献条目。
pub type InvalidationHandler = Arc<dyn Fn(&str, &mut PendingUpdate) + Send + Sync>;

/// 将返回 Future 的闭包包装为 [`ModuleFactory`]
///
/// # 示例
///
/// ```ignore
/// let factory = module_factory(|ctx| async move {
///     let dep = ctx.require("leaf").await?;
///     Ok(serde_json::json!({ "dep": dep }))
/// });
/// ```
pub fn module_factory<F, Fut>(f: F) -> ModuleFactory
where
    F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// 清单中一个模块的变更
#[derive(Clone)]
pub enum ModuleChange {
    /// 新的模块工厂
    Factory(ModuleFactory),
    /// 移除标记：模块不再属于程序
    Removed,
}

impl fmt::Debug for ModuleChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleChange::Factory(_) => write!(f, "ModuleChange::Factory(..)"),
            ModuleChange::Removed => write!(f, "ModuleChange::Removed"),
        }
    }
}

/// 工厂表中的槽位
///
/// 被移除的模块留下哨兵槽位，任何后续 require 都会报错。
#[derive(Clone)]
pub(crate) enum FactorySlot {
    /// 可执行的工厂
    Active(ModuleFactory),
    /// 模块已被移除
    Removed,
}

/// 更新清单
///
/// `changed_modules` 保持清单顺序；同一 ID 以先写入者为准。
#[derive(Default, Clone)]
pub struct UpdateManifest {
    /// 变更的模块：ID -> 新工厂或移除标记
    pub changed_modules: Vec<(String, ModuleChange)>,

    /// 不再属于程序的模块 ID
    pub removed_modules: Vec<String>,

    /// 不再属于程序的代码块 ID
    pub removed_chunks: Vec<String>,

    /// 新代码安装后按顺序执行的运行时初始化器
    pub runtime_initializers: Vec<RuntimeInitializer>,
}

impl UpdateManifest {
    /// 创建空清单
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个变更模块
    pub fn with_module(mut self, module_id: impl Into<String>, factory: ModuleFactory) -> Self {
        self.changed_modules
            .push((module_id.into(), ModuleChange::Factory(factory)));
        self
    }

    /// 添加一个移除标记
    pub fn with_removed_module(mut self, module_id: impl Into<String>) -> Self {
        self.removed_modules.push(module_id.into());
        self
    }

    /// 添加一个被移除的代码块
    pub fn with_removed_chunk(mut self, chunk_id: impl Into<String>) -> Self {
        self.removed_chunks.push(chunk_id.into());
        self
    }

    /// 添加一个运行时初始化器
    pub fn with_runtime_initializer(mut self, init: RuntimeInitializer) -> Self {
        self.runtime_initializers.push(init);
        self
    }

    /// 携带新工厂的变更模块 ID 列表
    pub fn changed_ids(&self) -> Vec<String> {
        self.changed_modules
            .iter()
            .filter(|(_, change)| matches!(change, ModuleChange::Factory(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 清单是否不包含任何变更
    pub fn is_empty(&self) -> bool {
        self.changed_modules.is_empty()
            && self.removed_modules.is_empty()
            && self.removed_chunks.is_empty()
            && self.runtime_initializers.is_empty()
    }
}

impl fmt::Debug for UpdateManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateManifest")
            .field(
                "changed_modules",
                &self
                    .changed_modules
                    .iter()
                    .map(|(id, c)| (id.as_str(), c))
                    .collect::<Vec<_>>(),
            )
            .field("removed_modules", &self.removed_modules)
            .field("removed_chunks", &self.removed_chunks)
            .field("runtime_initializers", &self.runtime_initializers.len())
            .finish()
    }
}

/// 更新源
///
/// 引擎与编译器 / 传输层之间唯一的查询接口：返回"无更新"或
/// 一份更新清单。
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// 获取更新清单
    async fn fetch_manifest(&self) -> Result<Option<UpdateManifest>>;
}

/// 内存队列更新源
///
/// 按 FIFO 顺序吐出预先放入的清单，队列为空时报告"无更新"。
/// 主要用于测试和演示。
#[derive(Default)]
pub struct QueuedUpdateSource {
    queue: Mutex<VecDeque<UpdateManifest>>,
}

impl QueuedUpdateSource {
    /// 创建空的队列更新源
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入一份清单
    pub fn push(&self, manifest: UpdateManifest) {
        self.queue.lock().unwrap().push_back(manifest);
    }

    /// 队列中剩余的清单数量
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// 队列是否为空
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl UpdateSource for QueuedUpdateSource {
    async fn fetch_manifest(&self) -> Result<Option<UpdateManifest>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_factory() -> ModuleFactory {
        module_factory(|_ctx| async { Ok(Value::Null) })
    }

    #[test]
    fn test_manifest_builder() {
        let manifest = UpdateManifest::new()
            .with_module("leaf", dummy_factory())
            .with_removed_module("legacy")
            .with_removed_chunk("chunk-2")
            .with_runtime_initializer(Arc::new(|| {}));

        assert_eq!(manifest.changed_ids(), vec!["leaf"]);
        assert_eq!(manifest.removed_modules, vec!["legacy"]);
        assert_eq!(manifest.removed_chunks, vec!["chunk-2"]);
        assert_eq!(manifest.runtime_initializers.len(), 1);
        assert!(!manifest.is_empty());
    }

    #[test]
    fn test_empty_manifest() {
        assert!(UpdateManifest::new().is_empty());
    }

    #[tokio::test]
    async fn test_queued_source_fifo() {
        let source = QueuedUpdateSource::new();
        assert!(source.is_empty());

        source.push(UpdateManifest::new().with_module("a", dummy_factory()));
        source.push(UpdateManifest::new().with_module("b", dummy_factory()));
        assert_eq!(source.len(), 2);

        let first = source.fetch_manifest().await.unwrap().unwrap();
        assert_eq!(first.changed_ids(), vec!["a"]);

        let second = source.fetch_manifest().await.unwrap().unwrap();
        assert_eq!(second.changed_ids(), vec!["b"]);

        assert!(source.fetch_manifest().await.unwrap().is_none());
    }
}
