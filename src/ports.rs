//! Ports handed to the proxies.
//!
//! A [`PortReserver`] hands out free TCP ports. The [`PortPool`] built on top of it is the only
//! state shared between concurrently running matches: every match checks one [`PortSlot`] out
//! and the slot goes back to the reserver exactly once, when it is dropped.

use std::{
    collections::{HashSet, VecDeque},
    io,
    net::{Ipv4Addr, TcpListener},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, trace, warn};

use crate::error::RunnerError;

/// Source of free TCP ports.
pub trait PortReserver: Send + Sync {
    /// Reserve a port no other caller of this reserver holds.
    fn reserve(&self) -> io::Result<u16>;

    /// Give a reserved port back.
    fn release(&self, port: u16);
}

/// Asks the OS for ephemeral ports and remembers which ones are handed out.
#[derive(Debug, Default)]
pub struct EphemeralPorts {
    reserved: Mutex<HashSet<u16>>,
}

impl EphemeralPorts {
    /// Reserver with nothing handed out.
    pub fn new() -> Self {
        Self::default()
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PortReserver for EphemeralPorts {
    fn reserve(&self) -> io::Result<u16> {
        // the OS may give the same port back once the listener is closed
        for _ in 0..64 {
            let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?
                .local_addr()?
                .port();
            if self.reserved().insert(port) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no unreserved ephemeral port found",
        ))
    }

    fn release(&self, port: u16) {
        if !self.reserved().remove(&port) {
            warn!(port, "released a port that was not reserved");
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<u16>,
    in_flight: usize,
    peak: usize,
}

/// Ports reserved up front for a run, checked out one match at a time.
#[derive(Clone)]
pub struct PortPool {
    reserver: Arc<dyn PortReserver>,
    state: Arc<Mutex<PoolState>>,
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool").field("state", &self.state).finish()
    }
}

impl PortPool {
    /// Reserve `count` ports from `reserver`.
    ///
    /// On failure the ports already reserved are released.
    pub fn reserve(reserver: Arc<dyn PortReserver>, count: usize) -> Result<PortPool, RunnerError> {
        let mut available = VecDeque::with_capacity(count);
        for _ in 0..count {
            match reserver.reserve() {
                Ok(port) => available.push_back(port),
                Err(e) => {
                    for port in available {
                        reserver.release(port);
                    }
                    return Err(RunnerError::PortReservation(e));
                }
            }
        }
        debug!(?available, "ports reserved");
        Ok(PortPool {
            reserver,
            state: Arc::new(Mutex::new(PoolState {
                available,
                ..PoolState::default()
            })),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the next reserved port, `None` when all were checked out.
    pub fn checkout(&self) -> Option<PortSlot> {
        let mut state = self.state();
        let port = state.available.pop_front()?;
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        trace!(port, in_flight = state.in_flight, "port checked out");
        Some(PortSlot {
            port,
            pool: self.clone(),
        })
    }

    /// Ports currently checked out.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Highest number of ports checked out at the same time.
    pub fn peak(&self) -> usize {
        self.state().peak
    }

    /// Ports reserved and not checked out yet.
    pub fn available(&self) -> usize {
        self.state().available.len()
    }

    fn give_back(&self, port: u16) {
        {
            let mut state = self.state();
            state.in_flight -= 1;
            trace!(port, in_flight = state.in_flight, "port released");
        }
        self.reserver.release(port);
    }
}

impl Drop for PortPool {
    fn drop(&mut self) {
        // last handle, slots included: ports never checked out go back too
        if Arc::strong_count(&self.state) == 1 {
            let unused = std::mem::take(&mut self.state().available);
            for port in unused {
                self.reserver.release(port);
            }
        }
    }
}

/// A port checked out by one match. Returned to the reserver when dropped.
#[derive(Debug)]
pub struct PortSlot {
    port: u16,
    pool: PortPool,
}

impl PortSlot {
    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortSlot {
    fn drop(&mut self) {
        self.pool.give_back(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        next: Mutex<u16>,
        released: Mutex<Vec<u16>>,
        fail_after: Option<u16>,
    }

    impl PortReserver for Counting {
        fn reserve(&self) -> io::Result<u16> {
            let mut next = self.next.lock().unwrap();
            if Some(*next) == self.fail_after {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "exhausted"));
            }
            *next += 1;
            Ok(9000 + *next)
        }

        fn release(&self, port: u16) {
            self.released.lock().unwrap().push(port);
        }
    }

    #[test]
    fn slots_are_released_once() {
        let reserver = Arc::new(Counting::default());
        let pool = PortPool::reserve(reserver.clone(), 3).unwrap();

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(pool.in_flight(), 2);
        drop(a);
        assert_eq!(pool.in_flight(), 1);
        let c = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        drop((b, c));

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.peak(), 2);
        let mut released = reserver.released.lock().unwrap().clone();
        released.sort_unstable();
        assert_eq!(released, vec![9001, 9002, 9003]);
    }

    #[test]
    fn unused_ports_are_released_with_the_pool() {
        let reserver = Arc::new(Counting::default());
        let pool = PortPool::reserve(reserver.clone(), 2).unwrap();
        let slot = pool.checkout().unwrap();
        drop(pool);
        assert!(reserver.released.lock().unwrap().is_empty());
        drop(slot);
        assert_eq!(*reserver.released.lock().unwrap(), vec![9001, 9002]);
    }

    #[test]
    fn failed_reservation_releases_partial_pool() {
        let reserver = Arc::new(Counting {
            fail_after: Some(2),
            ..Counting::default()
        });
        let err = PortPool::reserve(reserver.clone(), 4).unwrap_err();
        assert!(matches!(err, RunnerError::PortReservation(_)));
        assert_eq!(*reserver.released.lock().unwrap(), vec![9001, 9002]);
    }

    #[test]
    fn ephemeral_ports_are_distinct() {
        let ports = EphemeralPorts::new();
        let a = ports.reserve().unwrap();
        let b = ports.reserve().unwrap();
        assert_ne!(a, b);
        ports.release(a);
        ports.release(b);
        assert!(ports.reserved().is_empty());
    }
}
