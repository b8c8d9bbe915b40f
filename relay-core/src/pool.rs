//! Proxy pool: upstream endpoints, per-endpoint health and stats, selection.
//! Probing itself is I/O and lives in the host; the host reports each probe
//! outcome through `record_probe`.

use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{LoadBalancing, ProxyConfig, ProxyPolicy};

/// One upstream CONNECT proxy, identified by `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub success_count: u64,
    /// Times this endpoint was handed out by `select`.
    pub selected_count: u64,
    pub last_checked_at: Option<SystemTime>,
}

impl ProxyEndpoint {
    fn from_config(c: &ProxyConfig) -> Self {
        Self {
            host: c.host.clone(),
            port: c.port,
            weight: c.weight,
            healthy: true,
            consecutive_failures: 0,
            success_count: 0,
            selected_count: 0,
            last_checked_at: None,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Health transitions reported back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    MarkedUnhealthy {
        index: usize,
        key: String,
        failures: u32,
    },
    Recovered {
        index: usize,
        key: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("proxy pool needs at least one endpoint")]
    Empty,
    #[error("no endpoint at index {0}")]
    NoSuchEndpoint(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolStats {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub unhealthy_proxies: usize,
    pub current_index: usize,
    pub proxies: Vec<ProxyEndpoint>,
}

pub struct ProxyPool {
    endpoints: Vec<ProxyEndpoint>,
    current: usize,
    mode: LoadBalancing,
    max_failures: u32,
}

impl ProxyPool {
    pub fn new(proxies: &[ProxyConfig], policy: &ProxyPolicy) -> Result<Self, PoolError> {
        if proxies.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self {
            endpoints: proxies.iter().map(ProxyEndpoint::from_config).collect(),
            current: 0,
            mode: policy.load_balancing,
            max_failures: policy.max_failures.max(1),
        })
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }

    /// Pick an endpoint for a new upstream connection. Never fails: in
    /// weighted mode with no healthy endpoint, the last-used one is returned.
    pub fn select(&mut self) -> &ProxyEndpoint {
        self.select_with(&mut rand::thread_rng())
    }

    pub fn select_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> &ProxyEndpoint {
        let index = match self.mode {
            LoadBalancing::RoundRobin => (self.current + 1) % self.endpoints.len(),
            LoadBalancing::WeightedRoundRobin => self.weighted_index(rng),
        };
        self.current = index;
        let endpoint = &mut self.endpoints[index];
        endpoint.selected_count += 1;
        endpoint
    }

    /// Cumulative-weight draw over healthy endpoints, in list order.
    fn weighted_index<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let healthy: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].healthy)
            .collect();
        let Some(&first) = healthy.first() else {
            return self.current;
        };
        let total: f64 = healthy
            .iter()
            .map(|&i| f64::from(self.endpoints[i].weight))
            .sum();
        if total <= 0.0 {
            return first;
        }
        let mut r = rng.gen_range(0.0..total);
        for &i in &healthy {
            r -= f64::from(self.endpoints[i].weight);
            if r <= 0.0 {
                return i;
            }
        }
        first
    }

    /// Apply one probe outcome. A success always restores health and clears
    /// the failure streak; `max_failures` consecutive failures mark the
    /// endpoint unhealthy.
    pub fn record_probe(
        &mut self,
        index: usize,
        reachable: bool,
        at: SystemTime,
    ) -> Result<Option<PoolEvent>, PoolError> {
        let max_failures = self.max_failures;
        let endpoint = self
            .endpoints
            .get_mut(index)
            .ok_or(PoolError::NoSuchEndpoint(index))?;
        endpoint.last_checked_at = Some(at);
        if reachable {
            let was_unhealthy = !endpoint.healthy;
            endpoint.healthy = true;
            endpoint.consecutive_failures = 0;
            endpoint.success_count += 1;
            return Ok(was_unhealthy.then(|| PoolEvent::Recovered {
                index,
                key: endpoint.key(),
            }));
        }
        endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
        if endpoint.healthy && endpoint.consecutive_failures >= max_failures {
            endpoint.healthy = false;
            return Ok(Some(PoolEvent::MarkedUnhealthy {
                index,
                key: endpoint.key(),
                failures: endpoint.consecutive_failures,
            }));
        }
        Ok(None)
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.healthy).count()
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let healthy = self.healthy_count();
        ProxyPoolStats {
            total_proxies: self.endpoints.len(),
            healthy_proxies: healthy,
            unhealthy_proxies: self.endpoints.len() - healthy,
            current_index: self.current,
            proxies: self.endpoints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn proxies(weights: &[u32]) -> Vec<ProxyConfig> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| ProxyConfig {
                host: format!("10.0.0.{}", i + 1),
                port: 8080,
                weight: w,
            })
            .collect()
    }

    fn pool(weights: &[u32], mode: LoadBalancing) -> ProxyPool {
        let policy = ProxyPolicy {
            load_balancing: mode,
            ..ProxyPolicy::default()
        };
        ProxyPool::new(&proxies(weights), &policy).unwrap()
    }

    fn fail_n(p: &mut ProxyPool, index: usize, n: u32) -> Vec<PoolEvent> {
        (0..n)
            .filter_map(|_| p.record_probe(index, false, SystemTime::now()).unwrap())
            .collect()
    }

    #[test]
    fn empty_pool_rejected() {
        assert!(matches!(
            ProxyPool::new(&[], &ProxyPolicy::default()),
            Err(PoolError::Empty)
        ));
    }

    #[test]
    fn round_robin_cycles_ignoring_health() {
        let mut p = pool(&[1, 1, 1], LoadBalancing::RoundRobin);
        fail_n(&mut p, 1, 3);
        assert!(!p.endpoints()[1].healthy);
        let hosts: Vec<String> = (0..4).map(|_| p.select().host.clone()).collect();
        assert_eq!(hosts, ["10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn weighted_equal_weights_converge_to_quarter() {
        let mut p = pool(&[10, 10, 10, 10], LoadBalancing::WeightedRoundRobin);
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 40_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            p.select_with(&mut rng);
            counts[p.current_index()] += 1;
        }
        for c in counts {
            let freq = c as f64 / draws as f64;
            assert!((freq - 0.25).abs() < 0.02, "frequency {freq} too far from 0.25");
        }
        let selected: u64 = p.endpoints().iter().map(|e| e.selected_count).sum();
        assert_eq!(selected, draws as u64);
    }

    #[test]
    fn weighted_respects_ratio() {
        let mut p = pool(&[10, 30], LoadBalancing::WeightedRoundRobin);
        let mut rng = StdRng::seed_from_u64(1);
        let mut heavy = 0;
        for _ in 0..20_000 {
            if p.select_with(&mut rng).host == "10.0.0.2" {
                heavy += 1;
            }
        }
        let freq = heavy as f64 / 20_000.0;
        assert!((freq - 0.75).abs() < 0.02, "frequency {freq}");
    }

    #[test]
    fn weighted_skips_unhealthy() {
        let mut p = pool(&[10, 10, 10], LoadBalancing::WeightedRoundRobin);
        fail_n(&mut p, 0, 3);
        fail_n(&mut p, 2, 3);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            assert_eq!(p.select_with(&mut rng).host, "10.0.0.2");
        }
    }

    #[test]
    fn weighted_all_unhealthy_returns_last_used() {
        let mut p = pool(&[10, 10, 10], LoadBalancing::WeightedRoundRobin);
        let mut rng = StdRng::seed_from_u64(9);
        let last = p.select_with(&mut rng).key();
        for i in 0..3 {
            fail_n(&mut p, i, 3);
        }
        assert_eq!(p.healthy_count(), 0);
        for _ in 0..10 {
            assert_eq!(p.select_with(&mut rng).key(), last);
        }
    }

    #[test]
    fn health_flapping() {
        let mut p = pool(&[10, 10], LoadBalancing::WeightedRoundRobin);
        assert!(fail_n(&mut p, 0, 2).is_empty());
        assert!(p.endpoints()[0].healthy);

        let events = fail_n(&mut p, 0, 1);
        assert_eq!(
            events,
            vec![PoolEvent::MarkedUnhealthy {
                index: 0,
                key: "10.0.0.1:8080".into(),
                failures: 3
            }]
        );
        assert!(!p.endpoints()[0].healthy);

        // Further failures keep counting without re-announcing.
        assert!(fail_n(&mut p, 0, 5).is_empty());
        assert_eq!(p.endpoints()[0].consecutive_failures, 8);

        let ev = p.record_probe(0, true, SystemTime::now()).unwrap();
        assert!(matches!(ev, Some(PoolEvent::Recovered { index: 0, .. })));
        let e = &p.endpoints()[0];
        assert!(e.healthy);
        assert_eq!(e.consecutive_failures, 0);
        assert_eq!(e.success_count, 1);
        assert!(e.last_checked_at.is_some());
    }

    #[test]
    fn record_probe_unknown_index() {
        let mut p = pool(&[1], LoadBalancing::RoundRobin);
        assert_eq!(
            p.record_probe(4, true, SystemTime::now()),
            Err(PoolError::NoSuchEndpoint(4))
        );
    }

    #[test]
    fn stats_counts_health() {
        let mut p = pool(&[1, 1, 1], LoadBalancing::RoundRobin);
        fail_n(&mut p, 2, 3);
        let s = p.stats();
        assert_eq!(s.total_proxies, 3);
        assert_eq!(s.healthy_proxies, 2);
        assert_eq!(s.unhealthy_proxies, 1);
    }
}
