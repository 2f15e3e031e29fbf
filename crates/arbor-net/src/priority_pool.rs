use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::message::PacketPriority;

type Job = Box<dyn FnOnce() + Send + 'static>;

const TIER_COUNT: usize = 3;
const QUEUE_CAP_PER_TIER: usize = 4096;

struct PoolState {
    queues: [VecDeque<Job>; TIER_COUNT],
    active: [usize; TIER_COUNT],
    total_active: usize,
}

/// Three-tier worker pool for inbound packet dispatch.
///
/// Worker reservations are 40% / 40% / 30% of the pool for the high, mid
/// and low tiers (at least one each). A tier past its reservation may
/// borrow a thread while every idle tier still keeps one thread reserved,
/// so no tier can be starved by the others.
pub struct PriorityThreadPool {
    inner: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
    max_total: usize,
    max_per_tier: [usize; TIER_COUNT],
    stop: AtomicBool,
}

impl PoolShared {
    /// Borrowing is allowed while every currently-idle tier keeps a spare
    /// thread.
    fn can_borrow(&self, state: &PoolState) -> bool {
        let reserved = state.active.iter().filter(|a| **a == 0).count();
        state.total_active < self.max_total.saturating_sub(reserved)
    }

    fn next_job(&self, state: &mut PoolState) -> Option<(usize, Job)> {
        let mut tier_capped = false;
        for tier in 0..TIER_COUNT {
            if state.queues[tier].is_empty() {
                continue;
            }
            if state.active[tier] >= self.max_per_tier[tier] {
                tier_capped = true;
                continue;
            }
            let job = state.queues[tier].pop_front()?;
            return Some((tier, job));
        }
        if !tier_capped || !self.can_borrow(state) {
            return None;
        }
        // Second pass ignoring tier caps: borrow a thread.
        for tier in 0..TIER_COUNT {
            if let Some(job) = state.queues[tier].pop_front() {
                debug!(tier, "borrowed worker thread for saturated tier");
                return Some((tier, job));
            }
        }
        None
    }
}

impl PriorityThreadPool {
    pub fn new(workers_count: usize) -> Self {
        let workers_count = workers_count.max(3);
        let high = (workers_count * 4 / 10).max(1);
        let mid = (workers_count * 4 / 10).max(1);
        let low = (workers_count * 3 / 10).max(1);

        let inner = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                active: [0; TIER_COUNT],
                total_active: 0,
            }),
            cv: Condvar::new(),
            max_total: workers_count,
            max_per_tier: [high, mid, low],
            stop: AtomicBool::new(false),
        });
        info!(
            workers = workers_count,
            high, mid, low, "packet dispatch pool initialized"
        );

        let workers = (0..workers_count)
            .map(|i| {
                let shared = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("net-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawning a pool worker cannot fail")
            })
            .collect();

        Self { inner, workers }
    }

    /// Enqueue a packet job. Returns false (drop) when the tier is full.
    pub fn post<F: FnOnce() + Send + 'static>(&self, priority: PacketPriority, job: F) -> bool {
        let tier = priority as usize;
        {
            let mut state = self.inner.state.lock();
            if state.queues[tier].len() >= QUEUE_CAP_PER_TIER {
                return false;
            }
            state.queues[tier].push_back(Box::new(job));
        }
        self.inner.cv.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state.queues.iter().map(|q| q.len()).sum()
    }

    pub fn shutdown(mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        // Claim a job and bump the active counters under one lock, so the
        // borrowing rule always sees consistent accounting.
        let (tier, job) = {
            let mut state = shared.state.lock();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                if let Some((tier, job)) = shared.next_job(&mut state) {
                    state.active[tier] += 1;
                    state.total_active += 1;
                    break (tier, job);
                }
                shared.cv.wait_for(&mut state, Duration::from_millis(100));
            }
        };

        job();

        {
            let mut state = shared.state.lock();
            state.active[tier] -= 1;
            state.total_active -= 1;
        }
        shared.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn executes_jobs_across_tiers() {
        let pool = PriorityThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..30 {
            let c = Arc::clone(&counter);
            let prio = match i % 3 {
                0 => PacketPriority::High,
                1 => PacketPriority::Mid,
                _ => PacketPriority::Low,
            };
            assert!(pool.post(prio, move || {
                c.fetch_add(1, Ordering::AcqRel);
            }));
        }
        assert!(wait_until(
            || counter.load(Ordering::Acquire) == 30,
            Duration::from_secs(5)
        ));
        pool.shutdown();
    }

    #[test]
    fn low_tier_is_not_starved_by_high_load() {
        let pool = PriorityThreadPool::new(4);
        let low_done = Arc::new(AtomicUsize::new(0));

        // Saturate high tier with slow jobs.
        for _ in 0..8 {
            pool.post(PacketPriority::High, || {
                std::thread::sleep(Duration::from_millis(50));
            });
        }
        let c = Arc::clone(&low_done);
        pool.post(PacketPriority::Low, move || {
            c.fetch_add(1, Ordering::AcqRel);
        });

        assert!(wait_until(
            || low_done.load(Ordering::Acquire) == 1,
            Duration::from_secs(5)
        ));
        pool.shutdown();
    }

    #[test]
    fn shutdown_joins_workers() {
        let pool = PriorityThreadPool::new(3);
        let ran = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&ran);
        pool.post(PacketPriority::Mid, move || {
            c.fetch_add(1, Ordering::AcqRel);
        });
        assert!(wait_until(
            || ran.load(Ordering::Acquire) == 1,
            Duration::from_secs(5)
        ));
        pool.shutdown();
    }
}
