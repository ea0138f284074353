//! Bounded work-stealing job pool

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Shared completion counters, updated by workers and read by the progress line.
#[derive(Debug)]
pub struct Progress {
    total: usize,
    concurrency: usize,
    completed: AtomicUsize,
    active: AtomicUsize,
}

/// Point-in-time view of [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub active: usize,
    pub concurrency: usize,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[PROGRESS] {}/{} ({:.1}%) active={}/{}",
            self.completed,
            self.total,
            self.percent(),
            self.active,
            self.concurrency
        )
    }
}

impl Progress {
    pub fn new(total: usize, concurrency: usize) -> Self {
        Self {
            total,
            concurrency,
            completed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    fn started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        info!("{}", self.snapshot());
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: self.completed.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            concurrency: self.concurrency,
        }
    }
}

/// Run `job` once for every subject with at most `concurrency` in flight.
///
/// Workers claim the next unclaimed index from a shared counter until the
/// worklist is exhausted. Each job runs in its own task, so a panicking job
/// is logged and the pool carries on.
pub async fn run<T, F, Fut>(worklist: Vec<T>, concurrency: usize, progress: Arc<Progress>, job: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let n = worklist.len();
    let workers = concurrency.max(1).min(n);
    if workers == 0 {
        return;
    }

    let worklist = Arc::new(worklist);
    let next = Arc::new(AtomicUsize::new(0));
    let job = Arc::new(job);

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let worklist = Arc::clone(&worklist);
            let next = Arc::clone(&next);
            let progress = Arc::clone(&progress);
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = worklist.get(idx).cloned() else {
                        break;
                    };

                    progress.started();
                    if let Err(e) = tokio::spawn((*job)(item, idx)).await {
                        error!("[JOB {}] aborted: {}", idx, e);
                    }
                    progress.finished();
                }
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_item_attempted_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::new(Progress::new(25, 4));
        let sink = Arc::clone(&seen);

        run((0..25).collect(), 4, Arc::clone(&progress), move |item: u32, idx| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis((item % 3) as u64)).await;
                sink.lock().push((item, idx));
            }
        })
        .await;

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen.len(), 25);
        for (i, (item, idx)) in seen.into_iter().enumerate() {
            assert_eq!(item as usize, i);
            assert_eq!(idx, i);
        }
        let snap = progress.snapshot();
        assert_eq!(snap.completed, 25);
        assert_eq!(snap.active, 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));

        run((0..12).collect::<Vec<u32>>(), 3, Arc::new(Progress::new(12, 3)), move |_, _| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                f.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_pool() {
        let done = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(Progress::new(6, 2));
        let counter = Arc::clone(&done);

        run((0..6).collect::<Vec<u32>>(), 2, Arc::clone(&progress), move |item, _| {
            let counter = Arc::clone(&counter);
            async move {
                if item == 2 {
                    panic!("job blew up");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(progress.snapshot().completed, 6);
    }

    #[tokio::test]
    async fn test_empty_worklist() {
        let progress = Arc::new(Progress::new(0, 3));
        run(Vec::<u32>::new(), 3, Arc::clone(&progress), |_, _| async {}).await;
        assert_eq!(progress.snapshot().completed, 0);
    }

    #[test]
    fn test_progress_line() {
        let snap = ProgressSnapshot {
            total: 8,
            completed: 3,
            active: 2,
            concurrency: 3,
        };
        assert_eq!(snap.to_string(), "[PROGRESS] 3/8 (37.5%) active=2/3");
    }
}
