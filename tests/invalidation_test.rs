//! 失效与状态机集成测试
//!
//! 覆盖可重入失效（提交进行中的 invalidate 不丢失）、阶段转移
//! 序列、阻塞加载跟踪以及空转幂等性。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use chips_hotswap::{
    module_factory, ApplyOptions, EngineConfig, HotSwapEngine, QueuedUpdateSource, Result,
    SwapError, UpdateManifest, UpdatePhase, UpdateSource,
};

fn new_engine() -> (HotSwapEngine, Arc<QueuedUpdateSource>) {
    let source = Arc::new(QueuedUpdateSource::new());
    (HotSwapEngine::new(source.clone()), source)
}

#[tokio::test]
async fn test_full_round_phase_sequence() {
    let (engine, source) = new_engine();
    engine.define_module(
        "app",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("v1"))
        }),
    );
    engine.require("app").await.unwrap();

    let phases = Arc::new(Mutex::new(Vec::new()));
    let phases_inner = Arc::clone(&phases);
    engine.on_status_change(Arc::new(move |phase| {
        phases_inner.lock().unwrap().push(phase);
    }));

    source.push(UpdateManifest::new().with_module(
        "app",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("v2"))
        }),
    ));
    engine.check().await.unwrap();
    engine.apply(ApplyOptions::new()).await.unwrap();

    let phases = phases.lock().unwrap();
    assert_eq!(
        *phases,
        vec![
            UpdatePhase::Check,
            UpdatePhase::Prepare,
            UpdatePhase::Ready,
            UpdatePhase::Dispose,
            UpdatePhase::Apply,
            UpdatePhase::Idle,
        ]
    );
}

#[tokio::test]
async fn test_invalidate_during_apply_triggers_second_pass() {
    let (engine, source) = new_engine();

    // side 被 app 引用并接受；app 的新工厂在重新执行时使 side 失效
    engine.define_module(
        "side",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("side-v1"))
        }),
    );
    engine.define_module(
        "app",
        module_factory(|ctx| async move {
            let side = ctx.require("side").await?;
            ctx.accept(&["side"], Arc::new(|_| Ok(())))?;
            ctx.accept_self()?;
            Ok(json!({ "side": side }))
        }),
    );
    engine.require("app").await.unwrap();

    let triggered = Arc::new(AtomicBool::new(false));
    let engine_for_factory = engine.clone();
    let triggered_factory = Arc::clone(&triggered);
    source.push(UpdateManifest::new().with_module(
        "app",
        module_factory(move |ctx| {
            let engine = engine_for_factory.clone();
            let triggered = Arc::clone(&triggered_factory);
            async move {
                let side = ctx.require("side").await?;
                ctx.accept(&["side"], Arc::new(|_| Ok(())))?;
                ctx.accept_self()?;
                // 重新执行发生在 apply 阶段，此时的失效请求必须排队
                if !triggered.swap(true, Ordering::SeqCst) {
                    assert_eq!(engine.status(), UpdatePhase::Apply);
                    engine.invalidate("side");
                }
                Ok(json!({ "side": side }))
            }
        }),
    ));

    let phases = Arc::new(Mutex::new(Vec::new()));
    let phases_inner = Arc::clone(&phases);
    engine.on_status_change(Arc::new(move |phase| {
        phases_inner.lock().unwrap().push(phase);
    }));

    engine.check().await.unwrap();
    let outdated = engine.apply(ApplyOptions::new()).await.unwrap();

    // 单次 apply 返回两轮合并去重后的结果，包含失效的 side
    assert!(outdated.iter().any(|m| m == "app"));
    assert!(outdated.iter().any(|m| m == "side"));
    assert_eq!(engine.status(), UpdatePhase::Idle);

    // 第二轮在回到 idle 之前自动运行：出现两次 dispose
    let phases = phases.lock().unwrap();
    let dispose_count = phases
        .iter()
        .filter(|p| **p == UpdatePhase::Dispose)
        .count();
    assert_eq!(dispose_count, 2);
    assert_eq!(*phases.last().unwrap(), UpdatePhase::Idle);
}

#[tokio::test]
async fn test_repeated_invalidation_hits_round_limit() {
    let source = Arc::new(QueuedUpdateSource::new());
    let config = EngineConfig::builder().max_rounds(3).build();
    let engine = HotSwapEngine::with_config(config, source.clone());

    engine.define_module("looper", module_factory(|_ctx| async { Ok(json!(null)) }));
    engine.define_module(
        "host",
        module_factory(|ctx| async move {
            ctx.require("looper").await?;
            ctx.accept(&["looper"], Arc::new(|_| Ok(())))?;
            Ok(json!(null))
        }),
    );
    engine.require("host").await.unwrap();

    // 行为不端的观察者：每次进入销毁阶段都再次标记失效，
    // 使排空循环永不收敛
    let engine_for_listener = engine.clone();
    engine.on_status_change(Arc::new(move |phase| {
        if phase == UpdatePhase::Dispose {
            engine_for_listener.invalidate("looper");
        }
    }));

    engine.invalidate("looper");
    assert_eq!(engine.status(), UpdatePhase::Ready);

    let result = engine.apply(ApplyOptions::new()).await;
    assert!(matches!(result, Err(SwapError::RoundLimitExceeded(3))));
    assert_eq!(engine.status(), UpdatePhase::Idle);
}

/// 在 check 阶段把模块标记失效的更新源（无清单返回）
struct InvalidatingSource {
    engine: Mutex<Option<HotSwapEngine>>,
    target: String,
}

#[async_trait]
impl UpdateSource for InvalidatingSource {
    async fn fetch_manifest(&self) -> Result<Option<UpdateManifest>> {
        if let Some(engine) = self.engine.lock().unwrap().take() {
            // 此时引擎处于 check 阶段，失效请求必须排队
            assert_eq!(engine.status(), UpdatePhase::Check);
            engine.invalidate(&self.target);
        }
        Ok(None)
    }
}

#[tokio::test]
async fn test_invalidation_queued_during_check_reaches_ready() {
    let source = Arc::new(InvalidatingSource {
        engine: Mutex::new(None),
        target: "widget".to_string(),
    });
    let engine = HotSwapEngine::new(source.clone());
    *source.engine.lock().unwrap() = Some(engine.clone());

    engine.define_module(
        "widget",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("v1"))
        }),
    );
    engine.define_module(
        "shell",
        module_factory(|ctx| async move {
            ctx.require("widget").await?;
            ctx.accept(&["widget"], Arc::new(|_| Ok(())))?;
            Ok(json!(null))
        }),
    );
    engine.require("shell").await.unwrap();

    // 无清单，但 check 期间排队的失效使引擎进入 ready
    let result = engine.check().await.unwrap();
    assert!(result.is_none());
    assert_eq!(engine.status(), UpdatePhase::Ready);

    let outdated = engine.apply(ApplyOptions::new()).await.unwrap();
    assert_eq!(outdated, vec!["widget"]);
    assert_eq!(engine.status(), UpdatePhase::Idle);
}

#[tokio::test]
async fn test_noop_check_leaves_everything_unchanged() {
    let (engine, _source) = new_engine();
    engine.define_module(
        "app",
        module_factory(|ctx| async move {
            ctx.require("leaf").await?;
            Ok(json!("app"))
        }),
    );
    engine.define_module("leaf", module_factory(|_ctx| async { Ok(json!("leaf")) }));
    engine.require("app").await.unwrap();

    let count_before = engine.module_count();
    let exports_before = engine.exports("app").unwrap();

    let result = engine.check().await.unwrap();
    assert!(result.is_none());

    assert_eq!(engine.status(), UpdatePhase::Idle);
    assert_eq!(engine.module_count(), count_before);
    assert_eq!(engine.exports("app").unwrap(), exports_before);
    assert_eq!(engine.children_of("app").unwrap(), vec!["leaf"]);
    assert!(engine.edges_consistent());
}

#[tokio::test]
async fn test_blocking_load_holds_prepare_until_done() {
    let (engine, source) = new_engine();
    engine.define_module(
        "app",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("v1"))
        }),
    );
    engine.require("app").await.unwrap();

    source.push(UpdateManifest::new().with_module(
        "app",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("v2"))
        }),
    ));
    engine.check().await.unwrap();
    assert_eq!(engine.status(), UpdatePhase::Ready);

    // ready 阶段发起的加载把阶段压回 prepare
    let loader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .track_blocking(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    "chunk"
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.status(), UpdatePhase::Prepare);
    assert_eq!(engine.blocking_in_flight(), 1);

    // prepare 阶段不允许 apply
    let result = engine.apply(ApplyOptions::new()).await;
    assert!(matches!(result, Err(SwapError::InvalidPhase { .. })));

    let loaded = loader.await.unwrap();
    assert_eq!(loaded, "chunk");
    assert_eq!(engine.status(), UpdatePhase::Ready);
    assert_eq!(engine.blocking_in_flight(), 0);

    // 加载完成后照常应用
    let outdated = engine.apply(ApplyOptions::new()).await.unwrap();
    assert_eq!(outdated, vec!["app"]);
}

#[tokio::test]
async fn test_invalidate_in_ready_merges_into_pending_round() {
    let (engine, source) = new_engine();
    engine.define_module(
        "a",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("a-v1"))
        }),
    );
    engine.define_module("b", module_factory(|_ctx| async { Ok(json!("b-v1")) }));
    engine.define_module(
        "root",
        module_factory(|ctx| async move {
            ctx.require("a").await?;
            ctx.require("b").await?;
            ctx.accept(&["b"], Arc::new(|_| Ok(())))?;
            Ok(json!(null))
        }),
    );
    engine.require("root").await.unwrap();

    source.push(UpdateManifest::new().with_module(
        "a",
        module_factory(|ctx| async move {
            ctx.accept_self()?;
            Ok(json!("a-v2"))
        }),
    ));
    engine.check().await.unwrap();
    assert_eq!(engine.status(), UpdatePhase::Ready);

    // ready 阶段的失效并入同一轮
    engine.invalidate("b");
    assert_eq!(engine.status(), UpdatePhase::Ready);

    let outdated = engine.apply(ApplyOptions::new()).await.unwrap();
    assert!(outdated.iter().any(|m| m == "a"));
    assert!(outdated.iter().any(|m| m == "b"));
    assert_eq!(engine.exports("a").unwrap(), json!("a-v2"));
}
