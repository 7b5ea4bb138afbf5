//! Idle pipe reaper.
//!
//! Pipes handed out by the orchestrator are watched here. A periodic scan
//! closes those idle for longer than a threshold that shrinks as the punch
//! pool fills up.

use crate::punch::PunchPool;
use crate::transport::PipeRef;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Reaper timing
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Scan interval
    pub interval: Duration,
    /// Idle limit with an empty pool
    pub max_idle: Duration,
    /// Idle limit with a saturated pool
    pub min_idle: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_idle: Duration::from_secs(7200),
            min_idle: Duration::from_secs(300),
        }
    }
}

/// Idle limit for a pool `saturation` in `[0, 1]`, linear between
/// `max_idle` and `min_idle`.
#[must_use]
pub fn idle_threshold(config: &ReaperConfig, saturation: f64) -> Duration {
    let s = saturation.clamp(0.0, 1.0);
    let max = config.max_idle.as_secs_f64();
    let min = config.min_idle.as_secs_f64().min(max);
    Duration::from_secs_f64(max - (max - min) * s)
}

async fn reap(pipes: &Mutex<VecDeque<PipeRef>>, threshold: Duration) -> usize {
    let mut pipes = pipes.lock().await;
    let mut closed = 0;
    let mut kept = VecDeque::with_capacity(pipes.len());
    while let Some(pipe) = pipes.pop_front() {
        if pipe.is_closed() {
            continue;
        }
        if pipe.idle_for() > threshold {
            let _ = pipe.close().await;
            closed += 1;
            continue;
        }
        kept.push_back(pipe);
    }
    *pipes = kept;
    closed
}

/// Closes watched pipes that sit idle too long.
pub struct IdleReaper {
    config: ReaperConfig,
    pool: PunchPool,
    pipes: Arc<Mutex<VecDeque<PipeRef>>>,
    worker: std::sync::Mutex<Option<AbortHandle>>,
}

impl IdleReaper {
    /// Reaper scaled by `pool`'s saturation. Call [`start`](Self::start)
    /// to scan periodically.
    #[must_use]
    pub fn new(config: ReaperConfig, pool: PunchPool) -> Self {
        Self {
            config,
            pool,
            pipes: Arc::new(Mutex::new(VecDeque::new())),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Current idle limit
    #[must_use]
    pub fn threshold(&self) -> Duration {
        idle_threshold(&self.config, self.pool.saturation())
    }

    /// Watch `pipe` until it closes.
    pub async fn watch(&self, pipe: PipeRef) {
        self.pipes.lock().await.push_back(pipe);
    }

    /// Pipes being watched
    pub async fn watched(&self) -> usize {
        self.pipes.lock().await.len()
    }

    /// One scan. Returns how many pipes were closed.
    pub async fn sweep(&self) -> usize {
        let closed = reap(&self.pipes, self.threshold()).await;
        if closed > 0 {
            info!("Reaped {} idle pipes", closed);
        }
        closed
    }

    /// Spawn the periodic scan. Restarting replaces the previous task.
    pub fn start(&self) {
        let pipes = self.pipes.clone();
        let pool = self.pool.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let threshold = idle_threshold(&config, pool.saturation());
                let closed = reap(&pipes, threshold).await;
                if closed > 0 {
                    info!("Reaped {} idle pipes", closed);
                }
            }
        })
        .abort_handle();

        if let Ok(mut worker) = self.worker.lock() {
            if let Some(old) = worker.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop scanning.
    pub fn stop(&self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
                debug!("Idle reaper stopped");
            }
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StillPipe {
        idle: Duration,
        closed: AtomicBool,
    }

    impl StillPipe {
        fn new(idle_secs: u64) -> Arc<Self> {
            Arc::new(Self {
                idle: Duration::from_secs(idle_secs),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl crate::transport::Pipe for StillPipe {
        async fn send(&self, buf: &[u8], _dest: Option<SocketAddr>) -> Result<usize> {
            Ok(buf.len())
        }

        async fn recv(&self, _timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>> {
            Ok(None)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn idle_for(&self) -> Duration {
            self.idle
        }
    }

    #[test]
    fn test_threshold_slides_with_saturation() {
        let config = ReaperConfig::default();
        assert_eq!(idle_threshold(&config, 0.0), Duration::from_secs(7200));
        assert_eq!(idle_threshold(&config, 1.0), Duration::from_secs(300));
        assert_eq!(idle_threshold(&config, 0.5), Duration::from_secs(3750));
        assert_eq!(idle_threshold(&config, 7.0), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_pipes() {
        let pool = PunchPool::new(2);
        let reaper = IdleReaper::new(ReaperConfig::default(), pool.clone());
        let busy = StillPipe::new(10);
        let idle = StillPipe::new(3600);
        reaper.watch(busy.clone()).await;
        reaper.watch(idle.clone()).await;

        // Empty pool: two hours of grace.
        assert_eq!(reaper.sweep().await, 0);
        assert_eq!(reaper.watched().await, 2);

        // Saturated pool: five minutes.
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(reaper.sweep().await, 1);
        assert!(idle.closed.load(Ordering::Relaxed));
        assert!(!busy.closed.load(Ordering::Relaxed));
        assert_eq!(reaper.watched().await, 1);
    }

    #[tokio::test]
    async fn test_periodic_scan() {
        let config = ReaperConfig {
            interval: Duration::from_millis(20),
            max_idle: Duration::from_secs(1),
            min_idle: Duration::from_secs(1),
        };
        let reaper = IdleReaper::new(config, PunchPool::new(1));
        let idle = StillPipe::new(5);
        reaper.watch(idle.clone()).await;
        reaper.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(idle.closed.load(Ordering::Relaxed));
        assert_eq!(reaper.watched().await, 0);
        reaper.stop();
    }
}
