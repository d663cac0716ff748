use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct Slot {
    /// 当前等待者，只会被 resolve 一次
    waiter: Option<oneshot::Sender<bool>>,
    /// 驱动任务的截止时间，重新 wait 时直接刷新
    deadline: Option<watch::Sender<Instant>>,
    driver: Option<JoinHandle<()>>,
}

/// 可取消的延时器
///
/// `wait` 到期返回 `true`，被 `cancel` 或被新的 `wait` 顶替时返回 `false`。
/// 同一时刻最多只有一个驱动任务，重复 `wait` 只刷新截止时间。
#[derive(Clone, Default)]
pub struct Timer {
    slot: Arc<Mutex<Slot>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 立即布置延时，返回的 future 只负责取结果
    pub fn wait(&self, delay: Duration) -> impl Future<Output = bool> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + delay;

        {
            let mut slot = self.slot.lock().unwrap();

            // 1. 顶替上一个等待者
            if let Some(previous) = slot.waiter.replace(tx) {
                let _ = previous.send(false);
            }

            // 2. 驱动任务还活着时刷新截止时间，否则新建
            let rearmed = slot
                .deadline
                .as_ref()
                .map(|sender| sender.send(deadline).is_ok())
                .unwrap_or(false);

            if !rearmed {
                let (deadline_tx, deadline_rx) = watch::channel(deadline);
                slot.deadline = Some(deadline_tx);
                slot.driver = Some(tokio::spawn(drive(self.slot.clone(), deadline_rx)));
            }
        }

        async move { rx.await.unwrap_or(false) }
    }

    /// 取消等待中的延时，返回是否确实有等待者被取消
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if let Some(driver) = slot.driver.take() {
            driver.abort();
        }
        slot.deadline = None;

        match slot.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(false);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().waiter.is_some()
    }
}

async fn drive(slot: Arc<Mutex<Slot>>, mut deadline: watch::Receiver<Instant>) {
    loop {
        let at = *deadline.borrow_and_update();

        tokio::select! {
            _ = tokio::time::sleep_until(at) => {}
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        let fired = {
            let mut slot = slot.lock().unwrap();
            match deadline.has_changed() {
                // 已被 cancel，槽位可能属于新的驱动任务
                Err(_) => return,
                Ok(true) => false,
                Ok(false) => {
                    slot.deadline = None;
                    slot.driver = None;
                    if let Some(waiter) = slot.waiter.take() {
                        let _ = waiter.send(true);
                    }
                    true
                }
            }
        };

        if fired {
            return;
        }
    }
}

/// 线性增长的重试延时器: initial, initial + increment, initial + 2 * increment ...
pub struct GrowingTimer {
    timer: Timer,
    initial: Duration,
    increment: Duration,
    last: Mutex<Option<Duration>>,
}

impl GrowingTimer {
    pub fn new(initial: Duration, increment: Duration) -> Self {
        Self {
            timer: Timer::new(),
            initial,
            increment,
            last: Mutex::new(None),
        }
    }

    /// 下一次 `wait` 将使用的延时
    pub fn current(&self) -> Duration {
        match *self.last.lock().unwrap() {
            Some(last) => last + self.increment,
            None => self.initial,
        }
    }

    pub fn wait(&self) -> impl Future<Output = bool> + Send + 'static {
        let delay = self.current();
        *self.last.lock().unwrap() = Some(delay);
        self.timer.wait(delay)
    }

    /// 回到初始延时，不影响正在等待的延时
    pub fn reset(&self) {
        *self.last.lock().unwrap() = None;
    }

    pub fn cancel(&self) -> bool {
        self.timer.cancel()
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_fires_after_delay() {
        let timer = Timer::new();
        let start = Instant::now();

        assert!(timer.wait(Duration::from_secs(5)).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));

        // 到期后取消是安全的空操作
        assert!(!timer.is_pending());
        assert!(!timer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_once() {
        let timer = Timer::new();
        let pending = timer.wait(Duration::from_secs(10));
        assert!(timer.is_pending());

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!pending.await);

        // 取消后还能继续使用
        assert!(timer.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_other_task() {
        let timer = Timer::new();
        let waiting = tokio::spawn(timer.wait(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(timer.cancel());
        assert!(!waiting.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewait_rearms_same_timer() {
        let timer = Timer::new();
        let start = Instant::now();

        let first = timer.wait(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let second = timer.wait(Duration::from_secs(10));

        assert!(!first.await);
        assert!(second.await);
        assert!(start.elapsed() >= Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_timer_sequence() {
        let timer = GrowingTimer::new(Duration::from_secs(6), Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(timer.current(), Duration::from_secs(6));
        assert!(timer.wait().await);
        assert_eq!(timer.current(), Duration::from_secs(7));
        assert!(timer.wait().await);
        assert!(start.elapsed() >= Duration::from_secs(13));

        timer.reset();
        assert_eq!(timer.current(), Duration::from_secs(6));
    }

    proptest! {
        #[test]
        fn prop_growing_timer_is_linear(initial in 0u64..10_000, increment in 0u64..10_000, steps in 1usize..12) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let timer = GrowingTimer::new(
                    Duration::from_millis(initial),
                    Duration::from_millis(increment),
                );

                for round in 0..2 {
                    for step in 0..steps {
                        let expected = Duration::from_millis(initial + increment * step as u64);
                        assert_eq!(timer.current(), expected, "round {} step {}", round, step);
                        let _pending = timer.wait();
                    }
                    timer.cancel();
                    timer.reset();
                }
            });
        }
    }
}
