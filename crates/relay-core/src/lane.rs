use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-slot operation lane: at most one operation runs at a time, and
/// waiters are admitted in arrival order.
#[derive(Debug, Default)]
pub struct FlushLane {
    slot: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FlushLane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the slot, then runs `op` to completion while holding it.
    pub async fn run<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.slot.lock().await;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        op.await
    }

    /// Resolves once every operation queued before this call has settled.
    pub async fn settle(&self) {
        let _slot = self.slot.lock().await;
    }

    /// Number of operations currently holding the slot (0 or 1).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running operations observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn operations_never_overlap_and_run_in_order() {
        let lane = Arc::new(FlushLane::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..5_u64 {
            let lane = lane.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                lane.run(async {
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    order.lock().unwrap().push(i);
                })
                .await;
            }));
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(lane.peak(), 1);
        assert_eq!(lane.in_flight(), 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_waits_for_running_operation() {
        let lane = Arc::new(FlushLane::new());
        let done = Arc::new(Mutex::new(false));

        let running = {
            let lane = lane.clone();
            let done = done.clone();
            tokio::spawn(async move {
                lane.run(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    *done.lock().unwrap() = true;
                })
                .await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(lane.in_flight(), 1);

        lane.settle().await;
        assert!(*done.lock().unwrap());
        running.await.unwrap();
    }
}
