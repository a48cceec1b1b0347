//! 基本使用示例
//!
//! 本示例展示了薯片热更新引擎的基本使用方法，包括：
//!
//! - 创建引擎实例并定义模块
//! - 模块的 accept / dispose 声明
//! - 走完一轮 check → apply 更新
//! - 观察阶段转移与更新指标
//!
//! # 运行示例
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use serde_json::json;

use chips_hotswap::{
    module_factory, ApplyOptions, HotSwapEngine, Logger, LoggerConfig, QueuedUpdateSource,
    UpdateManifest,
};

/// 主函数
///
/// 演示热更新引擎的基本用法。
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = Logger::try_init(LoggerConfig::builder().level("info").build());

    println!("=== 薯片热更新引擎基本使用示例 ===\n");

    // -------------------------------------------------------------------------
    // 1. 创建引擎并定义初始模块图
    // -------------------------------------------------------------------------
    println!("1. 创建引擎并定义模块...");

    let source = Arc::new(QueuedUpdateSource::new());
    let engine = HotSwapEngine::new(source.clone());

    // 叶子模块：纯数据
    engine.define_module(
        "config",
        module_factory(|_ctx| async { Ok(json!({ "greeting": "你好" })) }),
    );

    // 入口模块：依赖 config 并接受它的更新
    engine.define_module(
        "app",
        module_factory(|ctx| async move {
            let config = ctx.require("config").await?;
            ctx.accept(
                &["config"],
                Arc::new(|deps| {
                    println!("   [app] 依赖已更新: {:?}", deps);
                    Ok(())
                }),
            )?;
            ctx.on_dispose(Arc::new(|data| {
                data.insert("sessions".to_string(), json!(3));
            }))?;
            Ok(json!({ "config": config }))
        }),
    );

    let exports = engine.require("app").await?;
    println!("   入口模块导出: {}", exports);
    println!("   ✅ 模块图已加载（{} 个模块）\n", engine.module_count());

    // -------------------------------------------------------------------------
    // 2. 订阅阶段转移
    // -------------------------------------------------------------------------
    println!("2. 订阅阶段转移...");
    engine.on_status_change(Arc::new(|phase| {
        println!("   [状态] -> {}", phase);
    }));

    // -------------------------------------------------------------------------
    // 3. 放入更新清单并走完一轮更新
    // -------------------------------------------------------------------------
    println!("3. 应用一轮更新...");
    source.push(UpdateManifest::new().with_module(
        "config",
        module_factory(|_ctx| async { Ok(json!({ "greeting": "hello" })) }),
    ));

    engine.check().await?;
    let outdated = engine.apply(ApplyOptions::new()).await?;
    println!("   已替换模块: {:?}\n", outdated);

    // -------------------------------------------------------------------------
    // 4. 查看指标
    // -------------------------------------------------------------------------
    println!("4. 更新指标:");
    let metrics = engine.metrics();
    println!("   - 成功轮次: {}", metrics.rounds_applied);
    println!("   - 替换模块数: {}", metrics.modules_swapped);
    if let Some(at) = metrics.last_applied_at {
        println!("   - 最后应用时间: {}", at.to_rfc3339());
    }

    println!("\n=== 示例结束 ===");
    Ok(())
}
