//! Synchronized clock.
//!
//! Punch meetings and signaling ttls are absolute times that both peers
//! must agree on. Each node measures how far its system clock is from a
//! shared reference (NTP) and subtracts that skew from every reading.
//!
//! The skew estimate discards outliers in a few passes, keeping only
//! samples within one standard deviation of the running average, and
//! refuses to commit to an estimate that is still too noisy.

use crate::error::{Result, TraversalError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// SNTP request/response size.
const SNTP_PACKET_SIZE: usize = 48;

/// Current system time as fractional Unix seconds.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// A clock corrected for measured skew against a shared reference.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncClock {
    skew: f64,
}

impl SyncClock {
    /// Clock with a known skew (local minus reference, seconds).
    #[must_use]
    pub fn with_skew(skew: f64) -> Self {
        Self { skew }
    }

    /// Measured skew in seconds.
    #[must_use]
    pub fn skew(&self) -> f64 {
        self.skew
    }

    /// Reference time in Unix seconds.
    #[must_use]
    pub fn now(&self) -> f64 {
        unix_now() - self.skew
    }

    /// Collect `samples` readings from `source` concurrently and estimate
    /// the skew. Failed readings are skipped; an unusable sample set leaves
    /// the skew at zero.
    pub async fn calibrate(source: std::sync::Arc<dyn TimeSource>, samples: usize) -> Self {
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..samples {
            let source = source.clone();
            set.spawn(async move {
                let reference = source.reference_time().await.ok()?;
                Some(unix_now() - reference)
            });
        }

        let mut estimator = SkewEstimator::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(sample)) = joined {
                estimator.push(sample);
            }
        }

        let skew = estimator.estimate();
        debug!(
            "Clock skew {:.4}s from {} samples",
            skew,
            estimator.samples.len()
        );
        Self { skew }
    }
}

/// Outlier-rejecting skew estimator.
#[derive(Debug, Clone)]
pub struct SkewEstimator {
    samples: Vec<f64>,
    /// Passes of sigma clipping
    pub clean_steps: usize,
    /// Samples needed before an estimate is trusted
    pub min_data: usize,
    /// Largest acceptable standard deviation in seconds
    pub max_sdev: f64,
}

impl SkewEstimator {
    /// Estimator with the default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            clean_steps: 3,
            min_data: 20,
            max_sdev: 60.0,
        }
    }

    /// Add one `local - reference` sample.
    pub fn push(&mut self, sample: f64) {
        self.samples.push(sample);
    }

    /// Skew estimate, or `0.0` when the data is too sparse or too noisy.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        let mut points = self.samples.clone();
        if points.len() < 2 {
            return 0.0;
        }

        let mut avg = mean(&points);
        let mut sdev = pstdev(&points, avg);

        for _ in 0..self.clean_steps {
            let (lo, hi) = (avg - sdev - 1e-9, avg + sdev + 1e-9);
            points.retain(|v| *v >= lo && *v <= hi);
            if points.len() < 2 {
                break;
            }

            avg = mean(&points);
            sdev = pstdev(&points, avg);
            if sdev <= self.max_sdev || points.len() < self.min_data {
                break;
            }
        }

        if sdev > self.max_sdev || points.len() < self.min_data {
            return 0.0;
        }
        avg
    }
}

impl Default for SkewEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn pstdev(data: &[f64], avg: f64) -> f64 {
    let ss: f64 = data.iter().map(|x| (x - avg).powi(2)).sum();
    (ss / data.len() as f64).sqrt()
}

/// Source of reference time readings.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Reference time in Unix seconds.
    async fn reference_time(&self) -> Result<f64>;
}

/// Minimal SNTP (v3, client mode) query.
#[derive(Debug, Clone)]
pub struct SntpSource {
    server: SocketAddr,
    timeout: Duration,
}

impl SntpSource {
    /// Query `server` with a 2 second timeout.
    #[must_use]
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: Duration::from_secs(2),
        }
    }

    /// Build the 48-byte client request.
    #[must_use]
    pub fn request_packet() -> [u8; SNTP_PACKET_SIZE] {
        let mut packet = [0u8; SNTP_PACKET_SIZE];
        // LI = 0, VN = 3, Mode = 3 (client)
        packet[0] = 0x1B;
        packet
    }

    /// Extract the transmit timestamp from a server reply.
    ///
    /// # Errors
    ///
    /// `Protocol` if the reply is short or carries a zero timestamp.
    pub fn parse_reply(reply: &[u8]) -> Result<f64> {
        if reply.len() < SNTP_PACKET_SIZE {
            return Err(TraversalError::Protocol(format!(
                "short SNTP reply: {} bytes",
                reply.len()
            )));
        }
        let secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]);
        let frac = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]);
        if secs == 0 {
            return Err(TraversalError::Protocol("zero SNTP timestamp".into()));
        }
        let unix = u64::from(secs).saturating_sub(NTP_UNIX_OFFSET) as f64;
        Ok(unix + f64::from(frac) / 4_294_967_296.0)
    }
}

#[async_trait]
impl TimeSource for SntpSource {
    async fn reference_time(&self) -> Result<f64> {
        let bind = if self.server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(&Self::request_packet(), self.server).await?;

        let mut buf = [0u8; 128];
        let (len, from) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| TraversalError::Timeout("sntp"))??;
        if from.ip() != self.server.ip() {
            warn!("SNTP reply from unexpected source {}", from);
        }
        Self::parse_reply(&buf[..len])
    }
}
