use crate::liveness::LivenessProbe;
use chrono::{DateTime, Duration, Utc};
use portalloc_common::{ConnState, Lease};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a lease may stay `connecting` without a listener.
pub const DEFAULT_GRACE_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("no ports available: {requested} requested, {available} free")]
    NoPortsAvailable { requested: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Disconnected,
    ProcessDead,
    NotListening,
    ConnectTimedOut,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReclaimReason::Disconnected => "disconnected",
            ReclaimReason::ProcessDead => "process no longer alive",
            ReclaimReason::NotListening => "connected but no port in use",
            ReclaimReason::ConnectTimedOut => "connecting past grace period with no port in use",
        };
        f.write_str(s)
    }
}

/// The port pool plus every lease handed out from it.
///
/// A port is either in `pool` or in exactly one lease, never both.
#[derive(Debug)]
pub struct Registry {
    pool: VecDeque<u16>,
    clients: HashMap<u32, Lease>,
    grace: Duration,
}

impl Registry {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut seen = HashSet::new();
        let mut pool = VecDeque::new();
        for port in ports {
            if seen.insert(port) {
                pool.push_back(port);
            } else {
                warn!(port, "Ignoring duplicate port in pool");
            }
        }

        Self {
            pool,
            clients: HashMap::new(),
            grace: Duration::seconds(DEFAULT_GRACE_SECS),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Number of ports not held by any lease.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    pub fn lease_count(&self) -> usize {
        self.clients.len()
    }

    pub fn lease(&self, process: u32) -> Option<&Lease> {
        self.clients.get(&process)
    }

    /// Snapshot of all leases, ordered by process id.
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.clients.values().cloned().collect();
        leases.sort_by_key(|l| l.process);
        leases
    }

    /// Lease `n` ports to `process`.
    ///
    /// A process that already holds at least `n` ports gets the same ports
    /// back. One holding fewer keeps them and gets the difference appended.
    /// On failure nothing is mutated. Growing a lease restarts its lifecycle
    /// at `connecting`, whatever status it had reached.
    pub fn request_ports(
        &mut self,
        process: u32,
        n: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<u16>, AllocError> {
        let held = match self.clients.get(&process) {
            Some(lease) if lease.ports.len() >= n => {
                let ports = lease.ports[..n].to_vec();
                info!(process, ports = ?ports, "Returning same ports");
                return Ok(ports);
            }
            Some(lease) => lease.ports.len(),
            None if n == 0 => return Ok(Vec::new()),
            None => 0,
        };

        let missing = n - held;
        if self.pool.len() < missing {
            return Err(AllocError::NoPortsAvailable {
                requested: missing,
                available: self.pool.len(),
            });
        }
        let drawn: Vec<u16> = self.pool.drain(..missing).collect();

        let lease = match self.clients.entry(process) {
            Entry::Occupied(entry) => {
                let lease = entry.into_mut();
                lease.ports.extend(drawn);
                lease.status = ConnState::Connecting;
                lease.requested_at = now;
                lease
            }
            Entry::Vacant(entry) => entry.insert(Lease {
                process,
                ports: drawn,
                status: ConnState::Connecting,
                requested_at: now,
            }),
        };

        info!(process, ports = ?lease.ports, "Requested ports");
        Ok(lease.ports.clone())
    }

    /// Record a status report. Returns whether the lease changed.
    pub fn set_status(&mut self, process: u32, status: ConnState) -> bool {
        let Some(lease) = self.clients.get_mut(&process) else {
            debug!(process, %status, "Status for unknown process ignored");
            return false;
        };

        if lease.status == status {
            return false;
        }
        if !lease.status.can_transition_to(status) {
            warn!(process, from = %lease.status, to = %status, "Refusing status transition");
            return false;
        }

        lease.status = status;
        info!(process, %status, "Updated status");
        true
    }

    /// Drop every lease that is no longer backed by a live, listening process
    /// and put its ports back at the end of the pool.
    pub fn reclaim<P>(&mut self, probe: &P, now: DateTime<Utc>) -> Vec<(u32, ReclaimReason)>
    where
        P: LivenessProbe + ?Sized,
    {
        let mut processes: Vec<u32> = self.clients.keys().copied().collect();
        processes.sort_unstable();

        let mut reclaimed = Vec::new();
        for process in processes {
            let Some(lease) = self.clients.get(&process) else {
                continue;
            };

            let reason = if lease.status == ConnState::Disconnected {
                Some(ReclaimReason::Disconnected)
            } else if !probe.is_process_alive(process) {
                Some(ReclaimReason::ProcessDead)
            } else {
                match lease.status {
                    ConnState::Connected if !any_port_active(probe, &lease.ports) => {
                        Some(ReclaimReason::NotListening)
                    }
                    ConnState::Connecting
                        if now - lease.requested_at > self.grace
                            && !any_port_active(probe, &lease.ports) =>
                    {
                        Some(ReclaimReason::ConnectTimedOut)
                    }
                    _ => None,
                }
            };

            if let Some(reason) = reason {
                self.release(process);
                info!(process, %reason, "Reclaimed lease");
                reclaimed.push((process, reason));
            }
        }
        reclaimed
    }

    fn release(&mut self, process: u32) {
        if let Some(lease) = self.clients.remove(&process) {
            // Released ports go to the back so they are reused last
            self.pool.extend(lease.ports);
        }
    }
}

fn any_port_active<P: LivenessProbe + ?Sized>(probe: &P, ports: &[u16]) -> bool {
    ports.iter().any(|&port| probe.is_port_active(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeProbe {
        dead: HashSet<u32>,
        listening: HashSet<u16>,
        probed_ports: RefCell<Vec<u16>>,
    }

    impl LivenessProbe for FakeProbe {
        fn is_process_alive(&self, pid: u32) -> bool {
            !self.dead.contains(&pid)
        }

        fn is_port_active(&self, port: u16) -> bool {
            self.probed_ports.borrow_mut().push(port);
            self.listening.contains(&port)
        }
    }

    fn assert_no_double_lease(registry: &Registry) {
        let mut seen: HashSet<u16> = registry.pool.iter().copied().collect();
        assert_eq!(seen.len(), registry.pool.len());
        for lease in registry.clients.values() {
            for port in &lease.ports {
                assert!(seen.insert(*port), "port {} leased twice", port);
            }
        }
    }

    #[test]
    fn test_duplicate_ports_in_pool_are_dropped() {
        let registry = Registry::new([9000, 9001, 9000]);
        assert_eq!(registry.available(), 2);
    }

    #[test]
    fn test_ports_are_unique_across_leases() {
        let mut registry = Registry::new(9000..9010);
        let now = Utc::now();

        for pid in 1..=4 {
            registry.request_ports(pid, 2, now).unwrap();
            assert_no_double_lease(&registry);
        }
        assert_eq!(registry.available(), 2);
        assert_eq!(registry.lease_count(), 4);
        assert!(registry.request_ports(5, 3, now).is_err());
        assert_no_double_lease(&registry);
    }

    #[test]
    fn test_repeated_request_is_idempotent() {
        let mut registry = Registry::new([9000, 9001, 9002]);
        let now = Utc::now();

        let first = registry.request_ports(1, 2, now).unwrap();
        let second = registry.request_ports(1, 2, now).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.available(), 1);
    }

    #[test]
    fn test_smaller_request_returns_held_prefix() {
        let mut registry = Registry::new([9000, 9001, 9002]);
        let now = Utc::now();

        registry.request_ports(1, 3, now).unwrap();
        assert_eq!(registry.request_ports(1, 1, now).unwrap(), vec![9000]);
        assert_eq!(registry.lease(1).unwrap().ports.len(), 3);
    }

    #[test]
    fn test_partial_growth_keeps_existing_ports() {
        let mut registry = Registry::new([9000, 9001, 9002, 9003]);
        let start = Utc::now();

        let first = registry.request_ports(1, 1, start).unwrap();
        registry.set_status(1, ConnState::Connected);

        let later = start + Duration::seconds(5);
        let grown = registry.request_ports(1, 3, later).unwrap();
        assert_eq!(grown.len(), 3);
        assert_eq!(grown[0], first[0]);

        let lease = registry.lease(1).unwrap();
        assert_eq!(lease.status, ConnState::Connecting);
        assert_eq!(lease.requested_at, later);

        // The restarted lease may be reported connected again
        assert!(registry.set_status(1, ConnState::Connected));
    }

    #[test]
    fn test_failed_growth_leaves_lease_untouched() {
        let mut registry = Registry::new([9000, 9001]);
        let now = Utc::now();

        registry.request_ports(1, 1, now).unwrap();
        registry.request_ports(2, 1, now).unwrap();

        let err = registry.request_ports(1, 3, now).unwrap_err();
        assert_eq!(
            err,
            AllocError::NoPortsAvailable {
                requested: 2,
                available: 0
            }
        );
        assert_eq!(registry.lease(1).unwrap().ports, vec![9000]);
    }

    #[test]
    fn test_zero_ports_creates_no_lease() {
        let mut registry = Registry::new([9000]);
        assert!(registry.request_ports(1, 0, Utc::now()).unwrap().is_empty());
        assert!(registry.lease(1).is_none());
    }

    #[test]
    fn test_status_for_unknown_process_is_noop() {
        let mut registry = Registry::new([9000]);
        assert!(!registry.set_status(99, ConnState::Connected));
        assert!(registry.leases().is_empty());
    }

    #[test]
    fn test_no_transition_out_of_disconnected() {
        let mut registry = Registry::new([9000]);
        registry.request_ports(1, 1, Utc::now()).unwrap();

        assert!(registry.set_status(1, ConnState::Disconnected));
        assert!(!registry.set_status(1, ConnState::Connected));
        assert_eq!(registry.lease(1).unwrap().status, ConnState::Disconnected);
    }

    #[test]
    fn test_disconnected_lease_is_reclaimed_to_back_of_pool() {
        let mut registry = Registry::new([9000, 9001, 9002]);
        let now = Utc::now();
        let probe = FakeProbe::default();

        registry.request_ports(1, 2, now).unwrap();
        registry.set_status(1, ConnState::Disconnected);

        let reclaimed = registry.reclaim(&probe, now);
        assert_eq!(reclaimed, vec![(1, ReclaimReason::Disconnected)]);
        assert!(registry.lease(1).is_none());
        assert_eq!(registry.pool, VecDeque::from(vec![9002, 9000, 9001]));
    }

    #[test]
    fn test_dead_process_is_reclaimed() {
        let mut registry = Registry::new([9000, 9001]);
        let now = Utc::now();
        registry.request_ports(1, 1, now).unwrap();
        registry.request_ports(2, 1, now).unwrap();
        registry.set_status(1, ConnState::Connected);

        let probe = FakeProbe {
            dead: HashSet::from([1]),
            listening: HashSet::from([9001]),
            ..Default::default()
        };
        let reclaimed = registry.reclaim(&probe, now);
        assert_eq!(reclaimed, vec![(1, ReclaimReason::ProcessDead)]);
        assert!(registry.lease(2).is_some());
    }

    #[test]
    fn test_connected_without_listener_is_reclaimed() {
        let mut registry = Registry::new([9000, 9001, 9002, 9003]);
        let now = Utc::now();
        registry.request_ports(1, 2, now).unwrap();
        registry.request_ports(2, 2, now).unwrap();
        registry.set_status(1, ConnState::Connected);
        registry.set_status(2, ConnState::Connected);

        // Process 2 listens on its second port only
        let probe = FakeProbe {
            listening: HashSet::from([9003]),
            ..Default::default()
        };
        let reclaimed = registry.reclaim(&probe, now);
        assert_eq!(reclaimed, vec![(1, ReclaimReason::NotListening)]);
        assert!(registry.lease(2).is_some());
    }

    #[test]
    fn test_young_connecting_lease_is_not_probed() {
        let mut registry = Registry::new([9000]);
        let start = Utc::now();
        registry.request_ports(1, 1, start).unwrap();

        let probe = FakeProbe::default();
        let reclaimed = registry.reclaim(&probe, start + Duration::seconds(59));
        assert!(reclaimed.is_empty());
        assert!(probe.probed_ports.borrow().is_empty());
        assert!(registry.lease(1).is_some());
    }

    #[test]
    fn test_stale_connecting_lease_is_reclaimed() {
        let mut registry = Registry::new([9000, 9001]);
        let start = Utc::now();
        registry.request_ports(1, 1, start).unwrap();
        registry.request_ports(2, 1, start).unwrap();

        let probe = FakeProbe {
            listening: HashSet::from([9001]),
            ..Default::default()
        };
        let reclaimed = registry.reclaim(&probe, start + Duration::seconds(61));
        assert_eq!(reclaimed, vec![(1, ReclaimReason::ConnectTimedOut)]);
        assert!(registry.lease(2).is_some());
    }

    #[test]
    fn test_custom_grace_period() {
        let mut registry = Registry::new([9000]).with_grace_period(Duration::seconds(5));
        let start = Utc::now();
        registry.request_ports(1, 1, start).unwrap();

        let probe = FakeProbe::default();
        assert!(registry.reclaim(&probe, start + Duration::seconds(4)).is_empty());
        assert_eq!(registry.reclaim(&probe, start + Duration::seconds(6)).len(), 1);
    }

    #[test]
    fn test_two_port_scenario() {
        let mut registry = Registry::new([9000, 9001]);
        let probe = FakeProbe::default();
        let now = Utc::now();
        let (a, b) = (100, 200);

        registry.reclaim(&probe, now);
        assert_eq!(registry.request_ports(a, 2, now).unwrap(), vec![9000, 9001]);

        registry.reclaim(&probe, now);
        assert!(registry.request_ports(b, 1, now).is_err());

        registry.set_status(a, ConnState::Disconnected);

        registry.reclaim(&probe, now);
        let ports = registry.request_ports(b, 1, now).unwrap();
        assert!(ports == vec![9000] || ports == vec![9001]);
        assert_no_double_lease(&registry);
    }
}
