//! 热更新引擎
//!
//! 引擎对象整合模块注册表、生命周期状态机、阻塞加载跟踪器和
//! 提交执行器，驱动完整的 check → prepare → ready → dispose →
//! apply 更新轮次。每个程序实例持有一个引擎；引擎句柄可廉价克隆，
//! 多个引擎可在同一进程中共存。
//!
//! 内部状态由一把互斥锁保护，锁从不跨越挂起点或用户回调，因此
//! 销毁回调、状态观察者和接受回调都可以安全地反向调用引擎
//! （例如 `invalidate()`）。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::blocking::BlockingTracker;
use super::context::ModuleContext;
use super::effects::EffectResult;
use super::manifest::{
    CollectorWork, FactorySlot, InvalidationHandler, ModuleFactory, UpdateCollector, UpdateSource,
};
use super::options::{ApplyOptions, ErrorEvent, ErrorEventKind};
use super::plan::{build_plan, PendingUpdate, PlanPolicy, SelfAcceptItem, UpdatePlan};
use super::status::{PhaseListener, StatusBus, UpdatePhase};
use crate::core::config::EngineConfig;
use crate::module::{
    AcceptCallback, AcceptErrorContext, AcceptErrorHandler, CarryOverData, ModuleRecord,
    ModuleRegistry, SelfErrorContext,
};
use crate::utils::{Result, SwapError, UpdateMetrics, UpdateMetricsSnapshot};

/// 引擎可变状态
///
/// 所有字段在同一把锁下修改，保证阶段、注册表与待应用更新的
/// 组合始终一致。
pub(crate) struct EngineState {
    /// 模块注册表
    pub registry: ModuleRegistry,
    /// 工厂表：模块 ID -> 工厂槽位
    pub factories: HashMap<String, FactorySlot>,
    /// 各模块销毁时留下的交接数据
    pub module_data: HashMap<String, Value>,
    /// 已安装的代码块（供传输层登记）
    pub installed_chunks: HashSet<String>,
    /// 当前轮次的待应用更新
    pub pending: Option<PendingUpdate>,
    /// 提交期间排队的失效模块 ID（跨轮次保留）
    pub queued_invalidated: Vec<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            registry: ModuleRegistry::new(),
            factories: HashMap::new(),
            module_data: HashMap::new(),
            installed_chunks: HashSet::new(),
            pending: None,
            queued_invalidated: Vec::new(),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    status: StatusBus,
    blocking: BlockingTracker,
    source: Arc<dyn UpdateSource>,
    collectors: RwLock<Vec<(String, UpdateCollector)>>,
    invalidators: RwLock<Vec<(String, InvalidationHandler)>>,
    metrics: UpdateMetrics,
}

/// 记录应用阶段的首个错误；后续错误只记日志
#[derive(Default)]
struct ErrorSink {
    first: Option<SwapError>,
}

impl ErrorSink {
    fn report(&mut self, error: SwapError) {
        if self.first.is_none() {
            self.first = Some(error);
        } else {
            warn!(error = %error, "首个错误已记录，附加错误仅记日志");
        }
    }
}

/// 热更新引擎
///
/// # 示例
///
/// ```ignore
/// use chips_hotswap::{HotSwapEngine, QueuedUpdateSource};
/// use std::sync::Arc;
///
/// let source = Arc::new(QueuedUpdateSource::new());
/// let engine = HotSwapEngine::new(source.clone());
///
/// engine.define_module("app", module_factory(|ctx| async move {
///     ctx.accept_self()?;
///     Ok(serde_json::json!("v1"))
/// }));
/// engine.require("app").await?;
/// ```
#[derive(Clone)]
pub struct HotSwapEngine {
    inner: Arc<EngineInner>,
}

impl HotSwapEngine {
    /// 使用默认配置创建引擎
    pub fn new(source: Arc<dyn UpdateSource>) -> Self {
        Self::with_config(EngineConfig::default(), source)
    }

    /// 使用指定配置创建引擎
    pub fn with_config(config: EngineConfig, source: Arc<dyn UpdateSource>) -> Self {
        info!(max_rounds = config.update.max_rounds, "创建热更新引擎");
        Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(EngineState::new()),
                status: StatusBus::new(),
                blocking: BlockingTracker::new(),
                source,
                collectors: RwLock::new(Vec::new()),
                invalidators: RwLock::new(Vec::new()),
                metrics: UpdateMetrics::new(),
            }),
        }
    }

    /// 引擎配置
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// 当前生命周期阶段
    pub fn status(&self) -> UpdatePhase {
        self.inner.status.current()
    }

    /// 订阅阶段转移通知
    ///
    /// # Returns
    ///
    /// 订阅 ID，用于 [`Self::remove_status_listener`]
    pub fn on_status_change(&self, callback: PhaseListener) -> String {
        self.inner.status.subscribe(callback)
    }

    /// 取消阶段转移订阅
    pub fn remove_status_listener(&self, subscription_id: &str) -> Result<()> {
        self.inner.status.unsubscribe(subscription_id)
    }

    /// 当前更新指标快照
    pub fn metrics(&self) -> UpdateMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    // ==================== 模块定义与执行 ====================

    /// 注册模块工厂（不执行）
    pub fn define_module(&self, module_id: impl Into<String>, factory: ModuleFactory) {
        let module_id = module_id.into();
        trace!(module_id = %module_id, "注册模块工厂");
        let mut state = self.inner.state.lock().unwrap();
        state
            .factories
            .insert(module_id, FactorySlot::Active(factory));
    }

    /// 加载并执行模块，返回其导出值
    ///
    /// 已加载的模块直接返回缓存的导出值。以此方式顶层执行、且从未
    /// 被其他模块 require 过的模块是入口模块（`hot.main == true`）。
    pub async fn require(&self, module_id: &str) -> Result<Value> {
        self.execute_module(module_id, Vec::new(), false).await
    }

    /// 模块是否已加载
    pub fn is_loaded(&self, module_id: &str) -> bool {
        self.inner.state.lock().unwrap().registry.contains(module_id)
    }

    /// 已加载模块的导出值
    pub fn exports(&self, module_id: &str) -> Option<Value> {
        let state = self.inner.state.lock().unwrap();
        state.registry.get(module_id).map(|r| r.exports.clone())
    }

    /// 已加载模块的父模块列表
    pub fn parents_of(&self, module_id: &str) -> Option<Vec<String>> {
        let state = self.inner.state.lock().unwrap();
        state.registry.get(module_id).map(|r| r.parents.clone())
    }

    /// 已加载模块的子模块列表
    pub fn children_of(&self, module_id: &str) -> Option<Vec<String>> {
        let state = self.inner.state.lock().unwrap();
        state.registry.get(module_id).map(|r| r.children.clone())
    }

    /// 已加载模块数量
    pub fn module_count(&self) -> usize {
        self.inner.state.lock().unwrap().registry.len()
    }

    /// 校验注册表的双向边一致性
    pub fn edges_consistent(&self) -> bool {
        self.inner.state.lock().unwrap().registry.edges_consistent()
    }

    // ==================== 代码块登记（传输层接口） ====================

    /// 登记一个已安装的代码块
    pub fn register_chunk(&self, chunk_id: impl Into<String>) {
        let mut state = self.inner.state.lock().unwrap();
        state.installed_chunks.insert(chunk_id.into());
    }

    /// 代码块是否已安装
    pub fn is_chunk_installed(&self, chunk_id: &str) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.installed_chunks.contains(chunk_id)
    }

    // ==================== 外部扩展点 ====================

    /// 注册更新收集器
    ///
    /// 收集器在 `prepare` 阶段被调用，可追加自己的异步加载工作。
    /// 同名收集器会被替换。
    pub fn register_collector(&self, key: impl Into<String>, collector: UpdateCollector) {
        let key = key.into();
        let mut collectors = self.inner.collectors.write().unwrap();
        collectors.retain(|(k, _)| k != &key);
        collectors.push((key, collector));
    }

    /// 注册失效处理器
    ///
    /// 模块失效时被调用，向待应用更新累加器贡献条目。引擎内建的
    /// 处理器（快照模块当前工厂）总是先运行。同名处理器会被替换。
    pub fn register_invalidation_handler(
        &self,
        key: impl Into<String>,
        handler: InvalidationHandler,
    ) {
        let key = key.into();
        let mut invalidators = self.inner.invalidators.write().unwrap();
        invalidators.retain(|(k, _)| k != &key);
        invalidators.push((key, handler));
    }

    // ==================== 阻塞加载 ====================

    /// 跟踪一个在途异步加载
    ///
    /// 在 `ready` / `prepare` 阶段发起的加载会把阶段保持在
    /// `prepare`，直到所有被跟踪的加载完成才回到 `ready`；其余阶段
    /// 不做跟踪。
    pub async fn track_blocking<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        match self.inner.status.current() {
            UpdatePhase::Ready => {
                self.inner.status.transition(UpdatePhase::Prepare);
                self.inner.blocking.begin();
            }
            UpdatePhase::Prepare => {
                self.inner.blocking.begin();
            }
            _ => return fut.await,
        }

        let output = fut.await;
        if self.inner.blocking.finish() == 0 {
            self.inner.status.transition(UpdatePhase::Ready);
        }
        output
    }

    /// 当前在途加载数量
    pub fn blocking_in_flight(&self) -> usize {
        self.inner.blocking.in_flight()
    }

    // ==================== 失效 ====================

    /// 将模块标记为失效
    ///
    /// 行为取决于当前阶段：`idle` 下立即合成一个单模块更新轮次并
    /// 转为 `ready`；`ready` 下并入当前轮次；提交进行中（check /
    /// prepare / dispose / apply）则进入排队集合，在下一次 apply
    /// 开始时自动消费，保证失效请求不会被丢失。
    pub fn invalidate(&self, module_id: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(record) = state.registry.get_mut(module_id) {
                record.hot.self_invalidated = true;
            }
        }

        match self.inner.status.current() {
            UpdatePhase::Idle => {
                debug!(module_id = %module_id, "空闲阶段失效，合成更新轮次");
                self.run_invalidation_handlers(module_id);
                self.inner.status.transition(UpdatePhase::Ready);
            }
            UpdatePhase::Ready => {
                debug!(module_id = %module_id, "失效并入当前轮次");
                self.run_invalidation_handlers(module_id);
            }
            UpdatePhase::Check
            | UpdatePhase::Prepare
            | UpdatePhase::Dispose
            | UpdatePhase::Apply => {
                let mut state = self.inner.state.lock().unwrap();
                if !state.queued_invalidated.iter().any(|m| m == module_id) {
                    state.queued_invalidated.push(module_id.to_string());
                }
                debug!(module_id = %module_id, "失效请求已排队");
            }
            UpdatePhase::Abort | UpdatePhase::Fail => {
                warn!(module_id = %module_id, "终止阶段的失效请求被忽略");
            }
        }
    }

    /// 对一个失效模块运行内建与注册的失效处理器
    fn run_invalidation_handlers(&self, module_id: &str) {
        let (mut pending, slot) = {
            let mut state = self.inner.state.lock().unwrap();
            let pending = state.pending.take().unwrap_or_default();
            let slot = state.factories.get(module_id).cloned();
            (pending, slot)
        };

        // 内建处理器：快照模块当前的工厂槽位；没有可用工厂的模块
        // 退化为移除标记
        match slot {
            Some(FactorySlot::Active(factory)) => {
                pending.insert_factory(module_id, factory);
            }
            Some(FactorySlot::Removed) | None => {
                pending.insert_tombstone(module_id);
            }
        }

        let handlers: Vec<InvalidationHandler> = {
            let invalidators = self.inner.invalidators.read().unwrap();
            invalidators.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(module_id, &mut pending);
        }

        let mut state = self.inner.state.lock().unwrap();
        state.pending = Some(pending);
    }

    /// 排空排队的失效模块
    ///
    /// # Returns
    ///
    /// 是否排空了至少一个失效请求
    fn drain_queued_invalidations(&self) -> bool {
        let queued = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.queued_invalidated)
        };
        if queued.is_empty() {
            return false;
        }
        debug!(count = queued.len(), "排空排队的失效请求");
        for module_id in &queued {
            self.run_invalidation_handlers(module_id);
        }
        true
    }

    // ==================== 检查 ====================

    /// 向更新源查询并准备一轮更新
    ///
    /// 只允许在 `idle` 阶段调用。
    ///
    /// # Returns
    ///
    /// 无可用更新时返回 `Ok(None)`（若有排队失效则阶段转为
    /// `ready`，否则回到 `idle`）；有更新时准备完成后转为 `ready`
    /// 并返回清单中变更的模块 ID 列表。
    pub async fn check(&self) -> Result<Option<Vec<String>>> {
        self.check_inner(None).await
    }

    /// 查询更新并在准备完成后立即应用
    ///
    /// # Returns
    ///
    /// 无可用更新时返回 `Ok(None)`；否则返回本轮所有被替换的
    /// 模块 ID。
    pub async fn check_and_apply(&self, options: ApplyOptions) -> Result<Option<Vec<String>>> {
        self.check_inner(Some(options)).await
    }

    async fn check_inner(&self, auto_apply: Option<ApplyOptions>) -> Result<Option<Vec<String>>> {
        let phase = self.inner.status.current();
        if phase != UpdatePhase::Idle {
            return Err(SwapError::InvalidPhase {
                operation: "check()",
                actual: phase,
            });
        }

        info!("开始检查更新");
        self.inner.status.transition(UpdatePhase::Check);

        let manifest = match self.inner.source.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(error) => {
                error!(error = %error, "更新源查询失败");
                self.inner.status.transition(UpdatePhase::Fail);
                self.inner.status.transition(UpdatePhase::Idle);
                return Err(error);
            }
        };

        let Some(manifest) = manifest else {
            let drained = self.drain_queued_invalidations();
            self.inner.status.transition(if drained {
                UpdatePhase::Ready
            } else {
                UpdatePhase::Idle
            });
            debug!(drained, "无可用更新");
            return Ok(None);
        };

        self.inner.status.transition(UpdatePhase::Prepare);
        let updated_modules = manifest.changed_ids();
        info!(
            changed = updated_modules.len(),
            removed = manifest.removed_modules.len(),
            "收到更新清单"
        );

        // 清单内容写入待应用累加器；与已有条目取并集，先写入者生效
        {
            let mut pending = PendingUpdate::from_manifest(&manifest);
            let mut state = self.inner.state.lock().unwrap();
            if let Some(previous) = state.pending.take() {
                pending.merge(previous);
            }
            state.pending = Some(pending);
        }

        // 收集器追加异步加载工作
        let mut work: Vec<CollectorWork> = Vec::new();
        {
            let collectors = self.inner.collectors.read().unwrap();
            for (key, collector) in collectors.iter() {
                trace!(key = %key, "调用更新收集器");
                collector(&manifest, &mut work);
            }
        }
        for task in work {
            if let Err(error) = task.await {
                error!(error = %error, "准备阶段的加载工作失败");
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.pending = None;
                }
                self.inner.status.transition(UpdatePhase::Abort);
                self.inner.status.transition(UpdatePhase::Idle);
                self.inner.metrics.record_aborted();
                return Err(SwapError::PrepareFailed(error.to_string()));
            }
        }

        // 等待先于本次更新发起的在途加载完成
        self.inner.blocking.wait_until_idle().await;

        if let Some(options) = auto_apply {
            let outdated = self.internal_apply(options).await?;
            return Ok(Some(outdated));
        }

        self.inner.status.transition(UpdatePhase::Ready);
        Ok(Some(updated_modules))
    }

    // ==================== 应用 ====================

    /// 应用已就绪的更新轮次
    ///
    /// 只允许在 `ready` 阶段调用，否则立即失败。
    ///
    /// # Returns
    ///
    /// 本轮（含失效排空产生的额外轮次）所有被替换模块的去重列表。
    pub async fn apply(&self, options: ApplyOptions) -> Result<Vec<String>> {
        let phase = self.inner.status.current();
        if phase != UpdatePhase::Ready {
            return Err(SwapError::InvalidPhase {
                operation: "apply()",
                actual: phase,
            });
        }
        self.internal_apply(options).await
    }

    /// 应用循环：排空失效、构建计划、两阶段提交，直到没有新的
    /// 失效请求为止
    async fn internal_apply(&self, options: ApplyOptions) -> Result<Vec<String>> {
        let mut final_outdated: Vec<String> = Vec::new();
        let max_rounds = self.inner.config.update.max_rounds;
        let mut rounds = 0usize;

        loop {
            rounds += 1;
            if rounds > max_rounds {
                error!(rounds, "失效排空轮次超出上限");
                self.inner.status.transition(UpdatePhase::Fail);
                self.inner.status.transition(UpdatePhase::Idle);
                self.inner.metrics.record_failed();
                return Err(SwapError::RoundLimitExceeded(max_rounds));
            }

            self.drain_queued_invalidations();

            let pending = {
                let mut state = self.inner.state.lock().unwrap();
                state.pending.take()
            };
            let Some(pending) = pending else {
                self.inner.status.transition(UpdatePhase::Fail);
                self.inner.status.transition(UpdatePhase::Idle);
                return Err(SwapError::NothingPending);
            };

            // 编排：锁内计算效果，锁外发送通知
            let policy = PlanPolicy {
                ignore_unaccepted: options.ignore_unaccepted,
                ignore_declined: options.ignore_declined,
            };
            let build = {
                let state = self.inner.state.lock().unwrap();
                build_plan(&state.registry, pending, policy)
            };
            self.notify_effects(&options, &build.notifications);

            let mut plan = match build.result {
                Ok(plan) => plan,
                Err(error) => {
                    warn!(error = %error, "更新轮次中止，无任何副作用");
                    self.inner.status.transition(UpdatePhase::Abort);
                    self.inner.status.transition(UpdatePhase::Idle);
                    self.inner.metrics.record_aborted();
                    return Err(error);
                }
            };

            // 两阶段提交：销毁完全先于任何安装
            self.inner.status.transition(UpdatePhase::Dispose);
            self.run_dispose_phase(&mut plan);

            self.inner.status.transition(UpdatePhase::Apply);
            let first_error = self.run_apply_phase(&mut plan, &options).await;

            for module_id in &plan.outdated_modules {
                if !final_outdated.iter().any(|m| m == module_id) {
                    final_outdated.push(module_id.clone());
                }
            }

            if let Some(error) = first_error {
                error!(error = %error, "应用阶段出错");
                self.inner.status.transition(UpdatePhase::Fail);
                self.inner.status.transition(UpdatePhase::Idle);
                self.inner.metrics.record_failed();
                return Err(error);
            }

            // 提交期间新到的失效请求（排队或已并入新的待应用更新）
            // 触发额外一轮，保证请求不丢失
            let more = {
                let state = self.inner.state.lock().unwrap();
                !state.queued_invalidated.is_empty() || state.pending.is_some()
            };
            if !more {
                break;
            }
            debug!("提交期间出现新的失效请求，继续下一轮");
        }

        self.inner.metrics.record_applied(final_outdated.len());
        self.inner.status.transition(UpdatePhase::Idle);
        info!(outdated = final_outdated.len(), rounds, "更新应用完成");
        Ok(final_outdated)
    }

    /// 把计划构建期产生的分类通知交给本轮回调
    fn notify_effects(&self, options: &ApplyOptions, notifications: &[EffectResult]) {
        for result in notifications {
            match result {
                EffectResult::Accepted { .. } => {
                    if let Some(callback) = &options.on_accepted {
                        callback(result);
                    }
                }
                EffectResult::SelfDeclined { .. } | EffectResult::Declined { .. } => {
                    if let Some(callback) = &options.on_declined {
                        callback(result);
                    }
                }
                EffectResult::Unaccepted { .. } => {
                    if let Some(callback) = &options.on_unaccepted {
                        callback(result);
                    }
                }
                EffectResult::Disposed { .. } => {
                    if let Some(callback) = &options.on_disposed {
                        callback(result);
                    }
                }
            }
        }
    }

    /// 销毁阶段：纯拆除，不触碰任何新代码
    fn run_dispose_phase(&self, plan: &mut UpdatePlan) {
        debug!(outdated = plan.outdated_modules.len(), "进入销毁阶段");

        {
            let mut state = self.inner.state.lock().unwrap();
            for chunk_id in &plan.removed_chunks {
                state.installed_chunks.remove(chunk_id);
            }
        }

        let mut stack = plan.outdated_modules.clone();
        while let Some(module_id) = stack.pop() {
            let handlers = {
                let state = self.inner.state.lock().unwrap();
                match state.registry.get(&module_id) {
                    Some(record) => record.hot.dispose_handlers.clone(),
                    None => continue,
                }
            };

            // 销毁回调在锁外运行，共同写入同一份交接数据
            let mut data = CarryOverData::new();
            for handler in &handlers {
                handler(&mut data);
            }

            let mut state = self.inner.state.lock().unwrap();
            state
                .module_data
                .insert(module_id.clone(), Value::Object(data));
            if let Some(record) = state.registry.get_mut(&module_id) {
                record.hot.active = false;
            }
            if let Some(record) = state.registry.remove(&module_id) {
                trace!(module_id = %module_id, "模块已销毁");
                plan.saved_parents
                    .insert(module_id.clone(), record.parents.clone());
                // 自身被销毁的接受方不再调用其接受回调
                plan.remove_outdated_dependencies_of(&module_id);
                for child_id in &record.children {
                    if let Some(child) = state.registry.get_mut(child_id) {
                        child.remove_parent(&module_id);
                    }
                }
                // 幸存的父模块解除指向已销毁模块的正向边
                for parent_id in &record.parents {
                    if let Some(parent) = state.registry.get_mut(parent_id) {
                        parent.remove_child(&module_id);
                    }
                }
            }
        }

        // 解除接受方父模块到其过期依赖的正向边
        let mut state = self.inner.state.lock().unwrap();
        for (parent_id, deps) in &plan.outdated_dependencies {
            if let Some(parent) = state.registry.get_mut(parent_id) {
                for dep in deps {
                    parent.remove_child(dep);
                }
            }
        }
    }

    /// 应用阶段：安装新工厂、运行初始化器、调用接受回调并重新
    /// 执行自我接受模块
    ///
    /// # Returns
    ///
    /// 本阶段记录的首个错误（若有）
    async fn run_apply_phase(
        &self,
        plan: &mut UpdatePlan,
        options: &ApplyOptions,
    ) -> Option<SwapError> {
        debug!("进入应用阶段");

        // 1. 安装新工厂（移除的模块安装哨兵）
        {
            let mut state = self.inner.state.lock().unwrap();
            for (module_id, slot) in plan.applied_factories.drain(..) {
                state.factories.insert(module_id, slot);
            }
        }

        // 2. 运行时初始化器按清单顺序执行
        for init in &plan.runtime_initializers {
            init();
        }

        let mut sink = ErrorSink::default();

        // 3. 接受回调：按父模块处理，回调按标识去重，每个回调收到
        //    该父模块名下完整的过期依赖列表
        for (parent_id, deps) in &plan.outdated_dependencies {
            let callbacks: Vec<(AcceptCallback, Option<AcceptErrorHandler>, String)> = {
                let state = self.inner.state.lock().unwrap();
                let Some(record) = state.registry.get(parent_id) else {
                    continue;
                };
                let mut unique: Vec<(AcceptCallback, Option<AcceptErrorHandler>, String)> =
                    Vec::new();
                for dep in deps {
                    if let Some(entry) = record.hot.accepted_dependencies.get(dep) {
                        if unique
                            .iter()
                            .any(|(cb, _, _)| Arc::ptr_eq(cb, &entry.callback))
                        {
                            continue;
                        }
                        unique.push((
                            entry.callback.clone(),
                            entry.error_handler.clone(),
                            dep.clone(),
                        ));
                    }
                }
                unique
            };

            for (callback, error_handler, dependency_id) in callbacks {
                trace!(parent_id = %parent_id, dependency_id = %dependency_id, "调用接受回调");
                if let Err(error) = callback(deps) {
                    self.handle_accept_error(
                        options,
                        &mut sink,
                        parent_id,
                        &dependency_id,
                        error_handler,
                        error,
                    );
                }
            }
        }

        // 4. 自我接受 / 入口模块按发现顺序重新执行
        let queue = std::mem::take(&mut plan.self_accept_queue);
        for item in queue {
            let parents = plan
                .saved_parents
                .get(&item.module_id)
                .cloned()
                .unwrap_or_default();
            debug!(module_id = %item.module_id, "重新执行自我接受模块");
            if let Err(error) = self
                .execute_module(&item.module_id, parents, !item.main)
                .await
            {
                self.handle_self_accept_error(options, &mut sink, &item, anyhow::Error::new(error));
            }
        }

        sink.first
    }

    /// 接受回调出错：先交给模块自己的错误处理器，处理器缺失或
    /// 自身出错时上报并记录
    fn handle_accept_error(
        &self,
        options: &ApplyOptions,
        sink: &mut ErrorSink,
        parent_id: &str,
        dependency_id: &str,
        error_handler: Option<AcceptErrorHandler>,
        error: anyhow::Error,
    ) {
        let context = AcceptErrorContext {
            module_id: parent_id.to_string(),
            dependency_id: dependency_id.to_string(),
        };
        match error_handler {
            Some(handler) => match handler(&error, &context) {
                Ok(()) => {
                    debug!(parent_id = %parent_id, "接受回调错误已被处理器吸收");
                }
                Err(handler_error) => {
                    if let Some(callback) = &options.on_errored {
                        callback(&ErrorEvent {
                            kind: ErrorEventKind::AcceptErrorHandlerErrored,
                            module_id: parent_id,
                            dependency_id: Some(dependency_id),
                            error: &handler_error,
                            original_error: Some(&error),
                        });
                    }
                    if !options.ignore_errored {
                        sink.report(SwapError::Execution {
                            module_id: parent_id.to_string(),
                            source: handler_error,
                        });
                        sink.report(SwapError::Execution {
                            module_id: parent_id.to_string(),
                            source: error,
                        });
                    }
                }
            },
            None => {
                if let Some(callback) = &options.on_errored {
                    callback(&ErrorEvent {
                        kind: ErrorEventKind::AcceptErrored,
                        module_id: parent_id,
                        dependency_id: Some(dependency_id),
                        error: &error,
                        original_error: None,
                    });
                }
                if !options.ignore_errored {
                    sink.report(SwapError::Execution {
                        module_id: parent_id.to_string(),
                        source: error,
                    });
                }
            }
        }
    }

    /// 自我接受模块重新执行出错：处理方式与接受回调一致
    fn handle_self_accept_error(
        &self,
        options: &ApplyOptions,
        sink: &mut ErrorSink,
        item: &SelfAcceptItem,
        error: anyhow::Error,
    ) {
        let context = SelfErrorContext {
            module_id: item.module_id.clone(),
        };
        match &item.error_handler {
            Some(handler) => match handler(&error, &context) {
                Ok(()) => {
                    debug!(module_id = %item.module_id, "重新执行错误已被处理器吸收");
                }
                Err(handler_error) => {
                    if let Some(callback) = &options.on_errored {
                        callback(&ErrorEvent {
                            kind: ErrorEventKind::SelfAcceptErrorHandlerErrored,
                            module_id: &item.module_id,
                            dependency_id: None,
                            error: &handler_error,
                            original_error: Some(&error),
                        });
                    }
                    if !options.ignore_errored {
                        sink.report(SwapError::Execution {
                            module_id: item.module_id.clone(),
                            source: handler_error,
                        });
                        sink.report(SwapError::Execution {
                            module_id: item.module_id.clone(),
                            source: error,
                        });
                    }
                }
            },
            None => {
                if let Some(callback) = &options.on_errored {
                    callback(&ErrorEvent {
                        kind: ErrorEventKind::SelfAcceptErrored,
                        module_id: &item.module_id,
                        dependency_id: None,
                        error: &error,
                        original_error: None,
                    });
                }
                if !options.ignore_errored {
                    sink.report(SwapError::Execution {
                        module_id: item.module_id.clone(),
                        source: error,
                    });
                }
            }
        }
    }

    // ==================== 模块激活路径 ====================

    /// 执行模块工厂并安装记录
    ///
    /// 已加载的模块直接返回缓存的导出值。记录在工厂执行前创建并
    /// 安装（携带的父列表会与存活的父模块重新连接）；工厂失败时
    /// 半成品记录被移除。
    pub(crate) fn execute_module(
        &self,
        module_id: &str,
        parents: Vec<String>,
        as_child: bool,
    ) -> BoxFuture<'_, Result<Value>> {
        let module_id = module_id.to_string();
        Box::pin(async move {
            let factory = {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(record) = state.registry.get(&module_id) {
                    return Ok(record.exports.clone());
                }
                let factory = match state.factories.get(&module_id) {
                    Some(FactorySlot::Active(factory)) => factory.clone(),
                    Some(FactorySlot::Removed) => {
                        return Err(SwapError::ModuleRemoved(module_id));
                    }
                    None => return Err(SwapError::FactoryMissing(module_id)),
                };
                let data = state.module_data.get(&module_id).cloned();
                let mut record = ModuleRecord::new(&module_id, !as_child, data);
                record.parents = parents;
                state.registry.install(record);
                factory
            };

            trace!(module_id = %module_id, "执行模块工厂");
            let ctx = ModuleContext::new(self.clone(), module_id.clone());
            match factory(ctx).await {
                Ok(exports) => {
                    let mut state = self.inner.state.lock().unwrap();
                    if let Some(record) = state.registry.get_mut(&module_id) {
                        record.exports = exports.clone();
                    }
                    Ok(exports)
                }
                Err(source) => {
                    // 执行失败的半成品记录连同其边一起移除
                    let mut state = self.inner.state.lock().unwrap();
                    if let Some(record) = state.registry.remove(&module_id) {
                        for parent_id in &record.parents {
                            if let Some(parent) = state.registry.get_mut(parent_id) {
                                parent.remove_child(&module_id);
                            }
                        }
                        for child_id in &record.children {
                            if let Some(child) = state.registry.get_mut(child_id) {
                                child.remove_parent(&module_id);
                            }
                        }
                    }
                    Err(SwapError::Execution { module_id, source })
                }
            }
        })
    }

    /// 在引擎状态锁下执行闭包
    ///
    /// 仅限 crate 内部使用；闭包内不得再调用会加锁的引擎方法。
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap();
        f(&mut state)
    }
}
