//! Session registry and virtual IP leases.
//!
//! A session is one physical connection, keyed by its transport address.
//! Sessions belong to a logical group (one client install), and every
//! session of a group shares the group's virtual IP. The IP stays leased
//! while at least one of its sessions is alive.
//!
//! Admission (secret check, IP choice, reply, record) runs under a single
//! mutex so two CONNECTs for the same group can never allocate two IPs.
//! Everything else reads the concurrent maps directly.

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::expiring::ExpiringMap;
use crate::packet::{ConnectRequest, TransportAddr};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Smallest-free-address allocator over `first..=last`.
///
/// Occupied addresses are kept as a sorted vector of integers.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    first: u32,
    last: u32,
    occupied: Vec<u32>,
}

impl IpAllocator {
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        Self {
            first: first.into(),
            last: last.into(),
            occupied: Vec::new(),
        }
    }

    /// The smallest address not currently occupied, or `None` when full.
    pub fn next_free(&self) -> Option<Ipv4Addr> {
        let v = &self.occupied;
        let candidate = match v.first() {
            None => self.first,
            Some(&lowest) if lowest > self.first => self.first,
            Some(&lowest) => {
                let top = v.len() - 1;
                if v[top] - lowest == top as u32 {
                    // Contiguous from the first address
                    v[top].checked_add(1)?
                } else {
                    // v[i] >= lowest + i for a sorted set; find the first
                    // index where the equality breaks.
                    let (mut lo, mut hi) = (0, top);
                    while lo < hi {
                        let mid = lo + (hi - lo) / 2;
                        if v[mid] == lowest + mid as u32 {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    lowest + lo as u32
                }
            }
        };
        (candidate <= self.last).then(|| Ipv4Addr::from(candidate))
    }

    /// Mark `ip` occupied. Returns false if it already was or is out of range.
    pub fn occupy(&mut self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        if ip < self.first || ip > self.last {
            return false;
        }
        match self.occupied.binary_search(&ip) {
            Ok(_) => false,
            Err(pos) => {
                self.occupied.insert(pos, ip);
                true
            }
        }
    }

    /// Return `ip` to the pool. Returns false if it was not occupied.
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        match self.occupied.binary_search(&u32::from(ip)) {
            Ok(pos) => {
                self.occupied.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.len()
    }
}

/// Notified when the set of sessions behind a virtual IP changes.
pub trait LeaseListener: Send + Sync {
    /// A session joined or left while the lease stays held.
    fn on_members_changed(&self, ip: Ipv4Addr);

    /// The last session left; the IP is back in the pool.
    fn on_lease_released(&self, ip: Ipv4Addr);
}

/// One physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Distinguishes a session from an earlier one at the same address.
    pub serial: u64,
    pub group_id: Arc<str>,
    pub ip: Ipv4Addr,
}

/// Result of a successful CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub ip: Ipv4Addr,
    /// False when the CONNECT refreshed an existing session.
    pub new_session: bool,
}

/// Live sessions behind one IP, stamped with a generation that changes on
/// every membership change.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub generation: u64,
    pub sessions: Arc<[TransportAddr]>,
}

enum LeaseEvent {
    MembersChanged(Ipv4Addr),
    Released(Ipv4Addr),
}

struct Lease {
    group_id: Arc<str>,
    members: Vec<(u64, TransportAddr)>,
    snapshot: MemberSnapshot,
}

struct LeaseState {
    allocator: IpAllocator,
    groups: HashMap<Arc<str>, Ipv4Addr>,
}

/// Lease bookkeeping shared with the session map's eviction hook.
struct LeaseBook {
    state: Mutex<LeaseState>,
    /// Modified only while `state` is held.
    leases: DashMap<Ipv4Addr, Lease>,
    generation: AtomicU64,
    listener: Option<Arc<dyn LeaseListener>>,
}

impl LeaseBook {
    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn join_locked(&self, session: &Session, source: &TransportAddr) -> LeaseEvent {
        let mut lease = self.leases.entry(session.ip).or_insert_with(|| Lease {
            group_id: session.group_id.clone(),
            members: Vec::new(),
            snapshot: MemberSnapshot {
                generation: 0,
                sessions: Arc::from(Vec::new()),
            },
        });
        lease.members.push((session.serial, source.clone()));
        lease.snapshot = MemberSnapshot {
            generation: self.next_generation(),
            sessions: lease.members.iter().map(|(_, addr)| addr.clone()).collect(),
        };
        LeaseEvent::MembersChanged(session.ip)
    }

    fn leave_locked(&self, state: &mut LeaseState, session: &Session) -> Option<LeaseEvent> {
        let remaining = {
            let mut lease = self.leases.get_mut(&session.ip)?;
            let before = lease.members.len();
            lease.members.retain(|(serial, _)| *serial != session.serial);
            if lease.members.len() == before {
                return None;
            }
            if !lease.members.is_empty() {
                lease.snapshot = MemberSnapshot {
                    generation: self.next_generation(),
                    sessions: lease.members.iter().map(|(_, addr)| addr.clone()).collect(),
                };
            }
            lease.members.len()
        };

        if remaining > 0 {
            return Some(LeaseEvent::MembersChanged(session.ip));
        }

        if let Some((_, lease)) = self.leases.remove(&session.ip) {
            if state.groups.get(&lease.group_id) == Some(&session.ip) {
                state.groups.remove(&lease.group_id);
            }
        }
        state.allocator.release(session.ip);
        log::info!("Released {} (group {})", session.ip, session.group_id);
        Some(LeaseEvent::Released(session.ip))
    }

    fn leave(&self, session: &Session) {
        let event = {
            let mut state = self.lock();
            self.leave_locked(&mut state, session)
        };
        self.notify(event);
    }

    fn notify(&self, events: impl IntoIterator<Item = LeaseEvent>) {
        let Some(ref listener) = self.listener else {
            return;
        };
        for event in events {
            match event {
                LeaseEvent::MembersChanged(ip) => listener.on_members_changed(ip),
                LeaseEvent::Released(ip) => listener.on_lease_released(ip),
            }
        }
    }
}

/// Admits clients, leases virtual IPs and expires idle sessions.
pub struct SessionRegistry {
    secret: String,
    sessions: ExpiringMap<TransportAddr, Session>,
    book: Arc<LeaseBook>,
    next_serial: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry.
    ///
    /// `listener` hears about membership changes and released leases.
    pub fn new(
        secret: impl Into<String>,
        pool: IpAllocator,
        idle_timeout: Duration,
        listener: Option<Arc<dyn LeaseListener>>,
    ) -> Self {
        let book = Arc::new(LeaseBook {
            state: Mutex::new(LeaseState {
                allocator: pool,
                groups: HashMap::new(),
            }),
            leases: DashMap::new(),
            generation: AtomicU64::new(0),
            listener,
        });

        let hook_book = book.clone();
        let sessions = ExpiringMap::with_eviction_hook(idle_timeout, move |source, session: Session| {
            log::info!("Session {} ({}) expired", source, session.ip);
            hook_book.leave(&session);
        });

        Self {
            secret: secret.into(),
            sessions,
            book,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Create a registry from validated configuration.
    pub fn from_config(
        config: &RelayConfig,
        listener: Option<Arc<dyn LeaseListener>>,
    ) -> RelayResult<Self> {
        let (first, last) = config.client_ip_range()?;
        Ok(Self::new(
            config.shared_secret.clone(),
            IpAllocator::new(first.into(), last.into()),
            config.session_idle_timeout(),
            listener,
        ))
    }

    /// Admit a CONNECT from `source`.
    ///
    /// `send_params` is called with the chosen IP before anything is
    /// recorded; if it returns false the admission is abandoned. Returns
    /// `None` for a bad secret, an exhausted pool or a failed reply.
    pub fn admit<F>(
        &self,
        source: &TransportAddr,
        request: &ConnectRequest,
        send_params: F,
    ) -> Option<Admission>
    where
        F: FnOnce(Ipv4Addr) -> bool,
    {
        if request.secret != self.secret {
            log::debug!("CONNECT from {} rejected: bad secret", source);
            return None;
        }

        let mut events = Vec::new();
        let admission = {
            let mut state = self.book.lock();
            self.admit_locked(&mut state, source, request, send_params, &mut events)
        };
        self.book.notify(events);
        admission
    }

    fn admit_locked<F>(
        &self,
        state: &mut LeaseState,
        source: &TransportAddr,
        request: &ConnectRequest,
        send_params: F,
        events: &mut Vec<LeaseEvent>,
    ) -> Option<Admission>
    where
        F: FnOnce(Ipv4Addr) -> bool,
    {
        if let Some(previous) = self.sessions.peek(source) {
            let same_group = *previous.group_id == *request.group_id;
            // touch() fails once the session has expired, even if a sweep
            // has not removed it yet
            if same_group && self.sessions.touch(source) {
                if !send_params(previous.ip) {
                    return None;
                }
                return Some(Admission {
                    ip: previous.ip,
                    new_session: false,
                });
            }

            if same_group {
                log::debug!("Session {} expired before its CONNECT, admitting afresh", source);
            } else {
                log::info!(
                    "{} switched from group {} to {}, dropping old session",
                    source,
                    previous.group_id,
                    request.group_id
                );
            }
            if let Some(old) = self.sessions.remove(source) {
                events.extend(self.book.leave_locked(state, &old));
            }
        }

        let ip = match state.groups.get(request.group_id.as_str()) {
            Some(&ip) => ip,
            None => match state.allocator.next_free() {
                Some(ip) => ip,
                None => {
                    log::warn!("IP pool exhausted, CONNECT from {} dropped", source);
                    return None;
                }
            },
        };

        if !send_params(ip) {
            return None;
        }

        let group_id = match state.groups.get_key_value(request.group_id.as_str()) {
            Some((group_id, _)) => group_id.clone(),
            None => {
                let group_id: Arc<str> = Arc::from(request.group_id.as_str());
                state.allocator.occupy(ip);
                state.groups.insert(group_id.clone(), ip);
                log::info!("Leased {} to group {}", ip, group_id);
                group_id
            }
        };

        let session = Session {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            group_id,
            ip,
        };
        events.push(self.book.join_locked(&session, source));
        log::info!("Session {} joined {} (group {})", source, ip, session.group_id);
        self.sessions.insert(source.clone(), session);

        Some(Admission {
            ip,
            new_session: true,
        })
    }

    /// Remove the session at `source`, releasing its IP if it was the last.
    pub fn disconnect(&self, source: &TransportAddr) -> Option<Session> {
        let session = self.sessions.remove(source)?;
        log::info!("Session {} ({}) disconnected", source, session.ip);
        self.book.leave(&session);
        Some(session)
    }

    /// Find the live session at `source` and refresh its idle clock.
    pub fn lookup(&self, source: &TransportAddr) -> Option<Session> {
        self.sessions.get(source)
    }

    /// Snapshot of the live sessions behind `ip`.
    pub fn members(&self, ip: Ipv4Addr) -> Option<MemberSnapshot> {
        self.book.leases.get(&ip).map(|lease| lease.snapshot.clone())
    }

    /// The IP leased to `group_id`, if any.
    pub fn lease_of(&self, group_id: &str) -> Option<Ipv4Addr> {
        self.book.lock().groups.get(group_id).copied()
    }

    /// Evict idle sessions. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        self.sessions.sweep()
    }

    /// Tear down every session. Returns how many there were.
    pub fn clear(&self) -> usize {
        let drained = self.sessions.drain();
        let events: Vec<LeaseEvent> = {
            let mut state = self.book.lock();
            drained
                .iter()
                .filter_map(|(_, session)| self.book.leave_locked(&mut state, session))
                .collect()
        };
        self.book.notify(events);
        if !drained.is_empty() {
            log::info!("Cleared {} sessions", drained.len());
        }
        drained.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn lease_count(&self) -> usize {
        self.book.leases.len()
    }
}
