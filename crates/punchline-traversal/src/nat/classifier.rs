//! STUN based NAT classification.
//!
//! Three measurements make up a [`NatInfo`]:
//!
//! - the WAN IP, taken from the first value enough servers agree on;
//! - the filtering type, from RFC 3489 change-request probes raced across
//!   several servers in two phases;
//! - the port allocation delta, from mappings of many local ports.

use crate::error::{Result, TraversalError};
use crate::nat::stun::{ChangeRequest, StunClient, StunResponse};
use crate::nat::types::{Delta, DeltaType, MAX_PORT, NatInfo, NatType, StunProbeResult};
use crate::predict::field_dist;
use crate::reliable::ReliableConfig;
use crate::transport::UdpPipe;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Servers raced per NAT test
pub const NAT_TEST_NO: usize = 5;

/// Per-probe timeout for NAT tests
pub const NAT_TEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Local ports probed per delta phase
pub const DELTA_TEST_NO: usize = 8;

/// Cap on `delta_test_no`
pub const MAX_DELTA_TEST_NO: usize = 1000;

/// Agreeing samples needed to accept a delta
pub const DELTA_THRESHOLD: usize = 5;

/// Lowest local port used for delta probes
const DELTA_MIN_PORT: u16 = 4000;

/// A STUN server able to answer from an alternate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunServer {
    /// Address requests are sent to
    pub primary: SocketAddr,
    /// Alternate IP and port (CHANGED-ADDRESS)
    pub secondary: SocketAddr,
}

impl StunServer {
    /// Server with a known alternate address.
    #[must_use]
    pub fn new(primary: SocketAddr, secondary: SocketAddr) -> Self {
        Self { primary, secondary }
    }
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Servers used for WAN IP consensus and mappings
    pub servers: Vec<SocketAddr>,
    /// Tried when the primary list cannot agree
    pub fallback_servers: Vec<SocketAddr>,
    /// Change-request capable servers for the filtering test
    pub nat_servers: Vec<StunServer>,
    /// Agreeing answers needed to trust a WAN IP
    pub min_agree: usize,
    /// Overall bound on one consensus round
    pub timeout: Duration,
    /// Retransmission for ordinary probes
    pub reliable: ReliableConfig,
    /// Per-probe timeout for filtering tests
    pub nat_test_timeout: Duration,
    /// Ports probed per delta phase, clamped to `2..=MAX_DELTA_TEST_NO`
    pub delta_test_no: usize,
    /// Agreeing samples needed to accept a delta
    pub delta_threshold: usize,
    /// Probe delta ports concurrently
    pub delta_concurrency: bool,
}

impl StunConfig {
    /// Empty server lists with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            fallback_servers: Vec::new(),
            nat_servers: Vec::new(),
            min_agree: 2,
            timeout: Duration::from_secs(4),
            reliable: ReliableConfig::new().with_window(Duration::from_secs(1)),
            nat_test_timeout: NAT_TEST_TIMEOUT,
            delta_test_no: DELTA_TEST_NO,
            delta_threshold: DELTA_THRESHOLD,
            delta_concurrency: true,
        }
    }

    /// Add a primary server.
    pub fn add_server(&mut self, server: SocketAddr) -> &mut Self {
        self.servers.push(server);
        self
    }

    /// Add a fallback server.
    pub fn add_fallback_server(&mut self, server: SocketAddr) -> &mut Self {
        self.fallback_servers.push(server);
        self
    }

    /// Add a change-request capable server.
    pub fn add_nat_server(&mut self, server: StunServer) -> &mut Self {
        self.nat_servers.push(server);
        self
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces a NAT classification.
#[async_trait]
pub trait NatDetector: Send + Sync {
    /// Classify the NAT in front of this detector's interface.
    async fn detect(&self) -> Result<NatInfo>;
}

/// Classifies the NAT in front of one local IP.
#[derive(Debug, Clone)]
pub struct NatClassifier {
    config: StunConfig,
    bind_ip: IpAddr,
}

impl NatClassifier {
    /// Classifier probing from `bind_ip`.
    #[must_use]
    pub fn new(config: StunConfig, bind_ip: IpAddr) -> Self {
        Self { config, bind_ip }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &StunConfig {
        &self.config
    }

    /// Local IP probes are sent from
    #[must_use]
    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    /// External IP agreed on by at least `min_agree` servers.
    ///
    /// The primary list races first; the fallback list only runs when it
    /// fails to agree.
    ///
    /// # Errors
    ///
    /// `Consensus` when neither list reaches quorum.
    pub async fn get_wan_ip(&self) -> Result<IpAddr> {
        if let Some(ip) = self.quorum(&self.config.servers).await {
            return Ok(ip);
        }
        warn!(
            "No WAN IP quorum from {} primary servers, trying fallback list",
            self.config.servers.len()
        );
        self.quorum(&self.config.fallback_servers)
            .await
            .ok_or_else(|| {
                TraversalError::Consensus(format!(
                    "fewer than {} servers agreed on a WAN IP",
                    self.config.min_agree
                ))
            })
    }

    async fn quorum(&self, servers: &[SocketAddr]) -> Option<IpAddr> {
        let min_agree = self.config.min_agree.max(1);
        if servers.len() < min_agree {
            return None;
        }

        let mut set = JoinSet::new();
        for server in servers {
            let this = self.clone();
            let server = *server;
            set.spawn(async move { this.probe_server(0, server).await.map(|p| p.wan_ip) });
        }

        let mut votes: HashMap<IpAddr, usize> = HashMap::new();
        let race = async {
            while let Some(joined) = set.join_next().await {
                let Ok(Ok(ip)) = joined else {
                    continue;
                };
                let count = votes.entry(ip).or_default();
                *count += 1;
                if *count >= min_agree {
                    return Some(ip);
                }
            }
            None
        };

        let agreed = tokio::time::timeout(self.config.timeout, race)
            .await
            .ok()
            .flatten();
        if let Some(ip) = agreed {
            debug!("WAN IP {} agreed by {} servers", ip, min_agree);
        }
        agreed
    }

    async fn probe_server(&self, local_port: u16, server: SocketAddr) -> Result<StunProbeResult> {
        let client = StunClient::bind(
            SocketAddr::new(self.bind_ip, local_port),
            self.config.reliable.clone(),
        )?;
        let result = client.get_mapping(server).await;
        let _ = client.close().await;
        result
    }

    /// Mapping for `local_port` (0 lets the OS choose) from the first
    /// server that answers.
    ///
    /// # Errors
    ///
    /// The last probe error, or `Consensus` with no servers configured.
    pub async fn get_mapping(&self, local_port: u16) -> Result<StunProbeResult> {
        let mut last = TraversalError::Consensus("no STUN servers configured".into());
        for server in &self.config.servers {
            match self.probe_server(local_port, *server).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!("Mapping probe to {} failed: {}", server, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Probe each port against the servers in turn. Results keep the
    /// order of `ports`.
    async fn sample_ports(&self, ports: Vec<u16>) -> Vec<Option<(u16, u16)>> {
        let servers = &self.config.servers;
        if !self.config.delta_concurrency {
            let mut samples = Vec::with_capacity(ports.len());
            for (i, port) in ports.iter().enumerate() {
                let probe = self.probe_server(*port, servers[i % servers.len()]).await;
                samples.push(probe.ok().map(|p| (p.local.port(), p.mapped_port)));
            }
            return samples;
        }

        let mut set = JoinSet::new();
        for (i, port) in ports.iter().enumerate() {
            let this = self.clone();
            let (port, server) = (*port, servers[i % servers.len()]);
            set.spawn(async move { (i, this.probe_server(port, server).await) });
        }

        let mut samples = vec![None; ports.len()];
        while let Some(joined) = set.join_next().await {
            if let Ok((i, Ok(probe))) = joined {
                samples[i] = Some((probe.local.port(), probe.mapped_port));
            }
        }
        samples
    }

    /// Port allocation delta of the NAT.
    ///
    /// # Errors
    ///
    /// `Consensus` with no servers configured.
    pub async fn delta_test(&self) -> Result<Delta> {
        if self.config.servers.is_empty() {
            return Err(TraversalError::Consensus("no STUN servers configured".into()));
        }
        let test_no = self.config.delta_test_no.clamp(2, MAX_DELTA_TEST_NO);
        let threshold = self.config.delta_threshold;

        let random_ports: Vec<u16> = {
            let mut rng = rand::thread_rng();
            (0..test_no)
                .map(|_| rng.gen_range(DELTA_MIN_PORT..MAX_PORT))
                .collect()
        };
        let samples = self.sample_ports(random_ports).await;
        if let Some(delta) = DeltaTally::from_samples(&samples).random_phase(threshold) {
            debug!("Delta test found {:?}", delta);
            return Ok(delta);
        }

        let samples = self.sample_ports(sequential_ports(test_no)).await;
        let delta = DeltaTally::from_samples(&samples)
            .sequential_phase(threshold)
            .unwrap_or(Delta::of(DeltaType::Random));
        debug!("Delta test found {:?}", delta);
        Ok(delta)
    }

    /// Filtering type from change-request probes.
    ///
    /// # Errors
    ///
    /// `Bind` if the probe socket cannot be bound, `Consensus` if no
    /// usable server is configured.
    pub async fn fast_nat_test(&self) -> Result<NatType> {
        let servers = filter_nat_servers(&self.config.nat_servers);
        if servers.is_empty() {
            return Err(TraversalError::Consensus(
                "no change-request capable STUN servers".into(),
            ));
        }
        let servers: Vec<StunServer> = servers.into_iter().take(NAT_TEST_NO).collect();

        let pipe = Arc::new(UdpPipe::bind(SocketAddr::new(self.bind_ip, 0))?);
        let bound_ip = crate::transport::Pipe::local_addr(pipe.as_ref())?.ip();
        let client = Arc::new(StunClient::new(
            pipe,
            ReliableConfig::new()
                .with_tries(1)
                .with_window(self.config.nat_test_timeout),
        ));

        let mut replies: [Vec<SocketAddr>; 4] = Default::default();
        let mut fallback = NatType::SymmetricNAT;

        // Phase A: open / full cone
        let mut set = spawn_nat_tests(&client, &servers, &[NatTest::Plain, NatTest::ChangeBoth]);
        while let Some(joined) = set.join_next().await {
            let Ok((test, Some(response))) = joined else {
                continue;
            };
            replies[test.index()].push(response.mapped);
            if test == NatTest::ChangeBoth {
                let nat = if response.mapped.ip() == bound_ip {
                    NatType::OpenInternet
                } else {
                    NatType::FullCone
                };
                let _ = client.close().await;
                return Ok(nat);
            }
        }

        if replies[0].iter().any(|m| m.ip() == bound_ip) {
            let _ = client.close().await;
            return Ok(NatType::SymmetricUDPFirewall);
        }

        // Phase B: mapping reuse / restricted
        let mut set = spawn_nat_tests(
            &client,
            &servers,
            &[NatTest::SecondaryPlain, NatTest::ChangePort],
        );
        while let Some(joined) = set.join_next().await {
            let Ok((test, Some(response))) = joined else {
                continue;
            };
            replies[test.index()].push(response.mapped);
            match test {
                NatTest::ChangePort => {
                    let _ = client.close().await;
                    return Ok(NatType::RestrictNAT);
                }
                NatTest::SecondaryPlain => {
                    if replies[0].first().is_some_and(|m| *m == response.mapped) {
                        fallback = NatType::RestrictPortNAT;
                    }
                }
                _ => {}
            }
        }
        let _ = client.close().await;

        if replies.iter().all(Vec::is_empty) {
            return Ok(NatType::Blocked);
        }
        Ok(fallback)
    }

    /// Full classification: filtering type, then the delta unless the
    /// NAT does not translate.
    ///
    /// # Errors
    ///
    /// `Timeout` past `timeout`, otherwise errors from the individual tests.
    pub async fn get_nat_info(&self, timeout: Duration) -> Result<NatInfo> {
        tokio::time::timeout(timeout, async {
            let nat_type = self.fast_nat_test().await?;
            let delta = match nat_type {
                NatType::OpenInternet | NatType::SymmetricUDPFirewall => Delta::of(DeltaType::NA),
                NatType::Blocked => Delta::of(DeltaType::Random),
                _ => self.delta_test().await?,
            };
            let info = NatInfo::new(nat_type, delta);
            info!("NAT for {}: {}", self.bind_ip, info);
            Ok(info)
        })
        .await
        .map_err(|_| TraversalError::Timeout("nat classification"))?
    }
}

#[async_trait]
impl NatDetector for NatClassifier {
    async fn detect(&self) -> Result<NatInfo> {
        self.get_nat_info(self.config.timeout * 8).await
    }
}

#[async_trait]
impl crate::predict::MappingProbe for NatClassifier {
    async fn probe(&self, local_port: u16) -> Result<StunProbeResult> {
        self.get_mapping(local_port).await
    }
}

/// The four RFC 3489 probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NatTest {
    /// Plain request to primary, reply from primary
    Plain,
    /// Change IP and port, reply from secondary IP and port
    ChangeBoth,
    /// Plain request to secondary IP at primary port
    SecondaryPlain,
    /// Change port at secondary IP, reply from secondary IP and port
    ChangePort,
}

impl NatTest {
    fn index(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::ChangeBoth => 1,
            Self::SecondaryPlain => 2,
            Self::ChangePort => 3,
        }
    }

    /// (send to, expect reply from, change flags)
    fn plan(self, server: &StunServer) -> (SocketAddr, SocketAddr, ChangeRequest) {
        let alt_ip_primary_port = SocketAddr::new(server.secondary.ip(), server.primary.port());
        match self {
            Self::Plain => (server.primary, server.primary, ChangeRequest::NONE),
            Self::ChangeBoth => (server.primary, server.secondary, ChangeRequest::IP_AND_PORT),
            Self::SecondaryPlain => (alt_ip_primary_port, alt_ip_primary_port, ChangeRequest::NONE),
            Self::ChangePort => (alt_ip_primary_port, server.secondary, ChangeRequest::PORT),
        }
    }
}

fn spawn_nat_tests(
    client: &Arc<StunClient>,
    servers: &[StunServer],
    tests: &[NatTest],
) -> JoinSet<(NatTest, Option<StunResponse>)> {
    let mut set = JoinSet::new();
    for test in tests {
        for server in servers {
            let (dest, expect, change) = test.plan(server);
            let client = client.clone();
            let test = *test;
            set.spawn(async move {
                let reply = match client.request(dest, change).await {
                    Ok(response) if response.from == expect => Some(response),
                    Ok(response) => {
                        debug!(
                            "NAT test {:?} reply from {} (expected {})",
                            test, response.from, expect
                        );
                        None
                    }
                    Err(_) => None,
                };
                (test, reply)
            });
        }
    }
    set
}

/// Drop servers whose primary or secondary IP was already used.
fn filter_nat_servers(servers: &[StunServer]) -> Vec<StunServer> {
    let mut seen = HashSet::new();
    servers
        .iter()
        .filter(|s| {
            let fresh = !seen.contains(&s.primary.ip()) && !seen.contains(&s.secondary.ip());
            if fresh {
                seen.insert(s.primary.ip());
                seen.insert(s.secondary.ip());
            }
            fresh && s.primary.ip() != s.secondary.ip()
        })
        .copied()
        .collect()
}

/// Counters for one delta phase.
#[derive(Debug, Default)]
struct DeltaTally {
    equal: usize,
    preserving: usize,
    preserving_dists: HashSet<i32>,
    /// Mapped distance histogram for non-adjacent local ports
    independent: HashMap<i32, usize>,
    /// Mapped distance histogram for adjacent local ports
    dependent: HashMap<i32, usize>,
}

impl DeltaTally {
    /// Tally `(local, mapped)` samples in probe order. Failed probes are
    /// `None` and break the pair chain.
    fn from_samples(samples: &[Option<(u16, u16)>]) -> Self {
        let mut tally = Self::default();
        for (i, sample) in samples.iter().enumerate() {
            let Some((local, mapped)) = *sample else {
                continue;
            };
            if local == mapped {
                tally.equal += 1;
            }

            let Some(Some((prev_local, prev_mapped))) = i.checked_sub(1).map(|p| samples[p]) else {
                continue;
            };
            let dl = field_dist(local, prev_local, MAX_PORT).abs();
            let dm = field_dist(mapped, prev_mapped, MAX_PORT).abs();
            if dm == dl {
                if mapped != local {
                    tally.preserving += 1;
                    tally.preserving_dists.insert(dm);
                }
            } else if dl != 1 {
                *tally.independent.entry(dm).or_default() += 1;
            } else {
                *tally.dependent.entry(dm).or_default() += 1;
            }
        }
        tally
    }

    fn random_phase(&self, threshold: usize) -> Option<Delta> {
        if self.equal >= threshold {
            return Some(Delta::of(DeltaType::Equal));
        }
        if self.preserving_dists.len() > 1 && self.preserving >= threshold {
            return Some(Delta::of(DeltaType::Preserving));
        }
        best_bucket(&self.independent, threshold).map(|d| Delta::new(DeltaType::Independent, d))
    }

    fn sequential_phase(&self, threshold: usize) -> Option<Delta> {
        best_bucket(&self.dependent, threshold).map(|d| Delta::new(DeltaType::Dependent, d))
    }
}

/// Most frequent distance at or over `threshold`, smallest on ties.
fn best_bucket(histogram: &HashMap<i32, usize>, threshold: usize) -> Option<i32> {
    histogram
        .iter()
        .filter(|(_, n)| **n >= threshold)
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(d, _)| *d)
}

/// `count` consecutive local ports from a random start, all at or above
/// `DELTA_MIN_PORT`. Longer requests are cut to what fits.
fn sequential_ports(count: usize) -> Vec<u16> {
    let count = u16::try_from(count)
        .unwrap_or(u16::MAX)
        .min(MAX_PORT - DELTA_MIN_PORT);
    let start = rand::thread_rng().gen_range(DELTA_MIN_PORT..=MAX_PORT - count);
    (0..count).map(|i| start + i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::test_server::{Mapping, TestStunServer};

    fn loopback() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn fast_config() -> StunConfig {
        let mut config = StunConfig::new();
        config.reliable = ReliableConfig::new()
            .with_tries(2)
            .with_window(Duration::from_millis(150));
        config.nat_test_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn test_tally_equal() {
        let samples: Vec<_> = [5000u16, 31000, 7000, 60000, 12000, 4500]
            .iter()
            .map(|p| Some((*p, *p)))
            .collect();
        let tally = DeltaTally::from_samples(&samples);
        assert_eq!(tally.equal, 6);
        assert_eq!(tally.random_phase(5), Some(Delta::of(DeltaType::Equal)));
    }

    #[test]
    fn test_tally_preserving_needs_distinct_distances() {
        let locals = [5000u16, 9000, 9500, 20000, 21000, 30000, 30010];
        let samples: Vec<_> = locals.iter().map(|p| Some((*p, *p + 3))).collect();
        assert_eq!(
            DeltaTally::from_samples(&samples).random_phase(5),
            Some(Delta::of(DeltaType::Preserving))
        );

        // Same distance every time cannot tell preserving from independent.
        let locals = [5000u16, 5010, 5020, 5030, 5040, 5050, 5060];
        let samples: Vec<_> = locals.iter().map(|p| Some((*p, *p + 3))).collect();
        assert_eq!(DeltaTally::from_samples(&samples).random_phase(5), None);
    }

    #[test]
    fn test_tally_independent() {
        let locals = [5000u16, 9000, 9500, 20000, 21000, 30000, 40000, 45000];
        let samples: Vec<_> = locals
            .iter()
            .enumerate()
            .map(|(i, p)| Some((*p, 10000 + 2 * i as u16)))
            .collect();
        assert_eq!(
            DeltaTally::from_samples(&samples).random_phase(5),
            Some(Delta::new(DeltaType::Independent, 2))
        );
    }

    #[test]
    fn test_tally_dependent_and_gaps() {
        let samples: Vec<_> = (0..8u16)
            .map(|i| Some((6000 + i, 20000 + 4 * i)))
            .collect();
        let tally = DeltaTally::from_samples(&samples);
        assert_eq!(tally.random_phase(5), None);
        assert_eq!(
            tally.sequential_phase(5),
            Some(Delta::new(DeltaType::Dependent, 4))
        );

        let mut gappy = samples.clone();
        gappy[2] = None;
        gappy[5] = None;
        assert_eq!(DeltaTally::from_samples(&gappy).sequential_phase(5), None);
    }

    #[test]
    fn test_filter_nat_servers() {
        let a = StunServer::new(
            "192.0.2.1:3478".parse().unwrap(),
            "192.0.2.2:3479".parse().unwrap(),
        );
        let dup = StunServer::new(
            "192.0.2.2:3478".parse().unwrap(),
            "192.0.2.9:3479".parse().unwrap(),
        );
        let same_ip = StunServer::new(
            "198.51.100.1:3478".parse().unwrap(),
            "198.51.100.1:3479".parse().unwrap(),
        );
        let b = StunServer::new(
            "203.0.113.1:3478".parse().unwrap(),
            "203.0.113.2:3479".parse().unwrap(),
        );
        assert_eq!(filter_nat_servers(&[a, dup, same_ip, b]), vec![a, b]);
    }

    #[tokio::test]
    async fn test_wan_ip_quorum() {
        let s1 = TestStunServer::spawn(loopback(), None).await.unwrap();
        let s2 = TestStunServer::spawn(loopback(), None).await.unwrap();
        let mut config = fast_config();
        config.add_server(s1.primary()).add_server(s2.primary());

        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(classifier.get_wan_ip().await.unwrap(), loopback());
    }

    #[tokio::test]
    async fn test_wan_ip_falls_back_without_quorum() {
        let wan_a: IpAddr = "203.0.113.10".parse().unwrap();
        let wan_b: IpAddr = "203.0.113.20".parse().unwrap();
        let a = TestStunServer::spawn_with(loopback(), None, Mapping::Ip(wan_a), true)
            .await
            .unwrap();
        let b = TestStunServer::spawn_with(loopback(), None, Mapping::Ip(wan_b), true)
            .await
            .unwrap();
        let c = TestStunServer::spawn(loopback(), None).await.unwrap();
        let d = TestStunServer::spawn(loopback(), None).await.unwrap();

        let mut config = fast_config();
        config
            .add_server(a.primary())
            .add_server(b.primary())
            .add_fallback_server(c.primary())
            .add_fallback_server(d.primary());
        let classifier = NatClassifier::new(config.clone(), loopback());
        assert_eq!(classifier.get_wan_ip().await.unwrap(), loopback());

        config.fallback_servers.clear();
        let classifier = NatClassifier::new(config, loopback());
        assert!(matches!(
            classifier.get_wan_ip().await,
            Err(TraversalError::Consensus(_))
        ));
    }

    #[tokio::test]
    async fn test_delta_test_on_loopback_is_equal() {
        let server = TestStunServer::spawn(loopback(), None).await.unwrap();
        let mut config = fast_config();
        config.add_server(server.primary());
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.delta_test().await.unwrap(),
            Delta::of(DeltaType::Equal)
        );
    }

    #[tokio::test]
    async fn test_delta_test_preserving_offset() {
        let server = TestStunServer::spawn_with(loopback(), None, Mapping::Offset(11), true)
            .await
            .unwrap();
        let mut config = fast_config();
        config.add_server(server.primary());
        config.delta_concurrency = false;
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.delta_test().await.unwrap(),
            Delta::of(DeltaType::Preserving)
        );
    }

    #[test]
    fn test_sequential_ports_fit_range() {
        for count in [2, DELTA_TEST_NO, MAX_DELTA_TEST_NO, 61_535, 70_000, usize::MAX] {
            let ports = sequential_ports(count);
            assert_eq!(ports.len(), count.min(usize::from(MAX_PORT - DELTA_MIN_PORT)));
            assert!(ports[0] >= DELTA_MIN_PORT);
            assert!(ports.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }

    #[tokio::test]
    async fn test_delta_test_independent_counter() {
        let server =
            TestStunServer::spawn_with(loopback(), None, Mapping::sequential(20000, 7), true)
                .await
                .unwrap();
        let mut config = fast_config();
        config.add_server(server.primary());
        // One try per probe so retransmits cannot skip the counter.
        config.reliable = ReliableConfig::new()
            .with_tries(1)
            .with_window(Duration::from_millis(500));
        config.delta_test_no = 4;
        config.delta_threshold = 2;
        config.delta_concurrency = false;
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.delta_test().await.unwrap(),
            Delta::new(DeltaType::Independent, 7)
        );
    }

    #[tokio::test]
    async fn test_fast_nat_test_open_internet() {
        let server = TestStunServer::spawn(loopback(), Some("127.0.0.2".parse().unwrap()))
            .await
            .unwrap();
        let mut config = fast_config();
        config.add_nat_server(StunServer::new(server.primary(), server.changed()));
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.fast_nat_test().await.unwrap(),
            NatType::OpenInternet
        );
    }

    #[tokio::test]
    async fn test_fast_nat_test_full_cone() {
        let wan: IpAddr = "203.0.113.5".parse().unwrap();
        let server = TestStunServer::spawn_with(
            loopback(),
            Some("127.0.0.2".parse().unwrap()),
            Mapping::Ip(wan),
            true,
        )
        .await
        .unwrap();
        let mut config = fast_config();
        config.add_nat_server(StunServer::new(server.primary(), server.changed()));
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(classifier.fast_nat_test().await.unwrap(), NatType::FullCone);
    }

    #[tokio::test]
    async fn test_fast_nat_test_port_restricted_and_symmetric() {
        let wan: IpAddr = "203.0.113.5".parse().unwrap();
        let reuse = TestStunServer::spawn_with(
            loopback(),
            Some("127.0.0.2".parse().unwrap()),
            Mapping::Ip(wan),
            false,
        )
        .await
        .unwrap();
        let mut config = fast_config();
        config.add_nat_server(StunServer::new(reuse.primary(), reuse.changed()));
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.fast_nat_test().await.unwrap(),
            NatType::RestrictPortNAT
        );
        drop(reuse);

        let fresh = TestStunServer::spawn_with(
            loopback(),
            Some("127.0.0.2".parse().unwrap()),
            Mapping::sequential(30000, 1),
            false,
        )
        .await
        .unwrap();
        let mut config = fast_config();
        config.add_nat_server(StunServer::new(fresh.primary(), fresh.changed()));
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(
            classifier.fast_nat_test().await.unwrap(),
            NatType::SymmetricNAT
        );
    }

    #[tokio::test]
    async fn test_fast_nat_test_blocked() {
        let silent_a = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let primary = crate::transport::Pipe::local_addr(&silent_a).unwrap();
        let mut config = fast_config();
        config.add_nat_server(StunServer::new(
            primary,
            SocketAddr::new("127.0.0.2".parse().unwrap(), primary.port()),
        ));
        let classifier = NatClassifier::new(config, loopback());
        assert_eq!(classifier.fast_nat_test().await.unwrap(), NatType::Blocked);
    }

    #[tokio::test]
    async fn test_fast_nat_test_requires_servers() {
        let classifier = NatClassifier::new(fast_config(), loopback());
        assert!(matches!(
            classifier.fast_nat_test().await,
            Err(TraversalError::Consensus(_))
        ));
    }
}
