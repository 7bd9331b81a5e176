//! Join-window timers on the tokio runtime.
//!
//! Each timer is a sleeping task that posts the group code back to the relay
//! loop. Cancelling or dropping the handle aborts the task, so a disbanded
//! group never sees its timer fire.

use share_core::group::{GroupCode, JoinWindowScheduler, ScheduledTask};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct TokioJoinWindowScheduler {
    tx: mpsc::UnboundedSender<GroupCode>,
}

impl TokioJoinWindowScheduler {
    /// Returns the scheduler and the receiver that yields elapsed codes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GroupCode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JoinWindowScheduler for TokioJoinWindowScheduler {
    fn schedule(&mut self, code: &GroupCode, after: Duration) -> Box<dyn ScheduledTask> {
        let tx = self.tx.clone();
        let code = code.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!("Join window elapsed for {}", code);
            let _ = tx.send(code);
        });
        Box::new(TimerTask { handle })
    }
}

struct TimerTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask for TimerTask {
    fn cancel(&mut self) {
        self.handle.abort();
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut scheduler, mut rx) = TokioJoinWindowScheduler::new();
        let _task = scheduler.schedule(&GroupCode::from("123456"), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(GroupCode::from("123456")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (mut scheduler, mut rx) = TokioJoinWindowScheduler::new();
        let mut task = scheduler.schedule(&GroupCode::from("123456"), Duration::from_secs(1));
        task.cancel();

        let dropped = scheduler.schedule(&GroupCode::from("654321"), Duration::from_secs(1));
        drop(dropped);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
