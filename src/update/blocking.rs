//! 阻塞加载跟踪器
//!
//! 统计更新被发现之前就已发起的在途异步加载（例如动态导入的代码块），
//! 使 apply 不会与仍在加载的代码竞争。计数归零时唤醒所有等待者。

use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::trace;

/// 阻塞加载跟踪器
#[derive(Debug, Default)]
pub struct BlockingTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    /// 在途加载数量
    in_flight: usize,
    /// 计数归零时需要唤醒的等待者
    waiters: Vec<oneshot::Sender<()>>,
}

impl BlockingTracker {
    /// 创建新的跟踪器
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个在途加载
    pub fn begin(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight += 1;
        trace!(in_flight = inner.in_flight, "登记在途加载");
    }

    /// 结束一个在途加载，返回剩余数量
    ///
    /// 计数归零时唤醒所有等待者。
    pub fn finish(&self) -> usize {
        let (remaining, waiters) = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            let waiters = if inner.in_flight == 0 {
                std::mem::take(&mut inner.waiters)
            } else {
                Vec::new()
            };
            (inner.in_flight, waiters)
        };
        trace!(in_flight = remaining, "在途加载完成");
        for waiter in waiters {
            let _ = waiter.send(());
        }
        remaining
    }

    /// 当前在途加载数量
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    /// 等待所有在途加载完成
    ///
    /// 没有在途加载时立即返回。
    pub async fn wait_until_idle(&self) {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_flight == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        // 发送端在计数归零时被消费；被丢弃也视为空闲
        let _ = receiver.await;
    }
}
