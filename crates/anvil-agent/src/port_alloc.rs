//! Host port assignment.
//!
//! Every allocation runs against a [`PortSnapshot`] captured for that call only; there is no
//! cached port table. TCP and UDP are scanned independently, so the same number may be handed
//! out once per protocol.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    io::ErrorKind,
    net::{TcpListener, UdpSocket},
};

use anvil_model::{PortBinding, PortClaim, PortRequest, Protocol};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 25565,
            end: 25665,
        }
    }
}

/// Bound (port, protocol) pairs at capture time, with their holders when known.
#[derive(Debug, Clone, Default)]
pub struct PortSnapshot {
    claims: BTreeMap<(u16, Protocol), Option<String>>,
    released: BTreeSet<(u16, Protocol)>,
    probe_host: bool,
}

impl PortSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Also test-bind candidate ports on the host before treating them as free.
    pub fn with_host_probe(mut self) -> Self {
        self.probe_host = true;
        self
    }

    pub fn claim(&mut self, port: u16, protocol: Protocol, owner: Option<String>) {
        let slot = self.claims.entry((port, protocol)).or_insert(None);
        if slot.is_none() {
            *slot = owner;
        }
    }

    pub fn extend(&mut self, claims: impl IntoIterator<Item = PortClaim>) {
        for c in claims {
            self.claim(c.port, c.protocol, c.owner);
        }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Treats `owner`'s own bindings as free, for an instance about to be recreated. A pair
    /// held by someone else stays bound.
    pub fn release(&mut self, owner: &str, bindings: &[PortBinding]) {
        for b in bindings {
            let Some(port) = b.host_port else {
                continue;
            };
            let key = (port, b.protocol);
            match self.claims.get(&key) {
                Some(Some(holder)) if holder != owner => continue,
                _ => {}
            }
            self.claims.remove(&key);
            self.released.insert(key);
        }
    }

    pub fn is_bound(&self, port: u16, protocol: Protocol) -> bool {
        if port == 0 {
            return true;
        }
        if self.released.contains(&(port, protocol)) {
            return false;
        }
        if self.claims.contains_key(&(port, protocol)) {
            return true;
        }
        self.probe_host && !bind_probe(port, protocol)
    }

    fn claim_for(&self, port: u16, protocol: Protocol) -> PortClaim {
        PortClaim {
            port,
            protocol,
            owner: self.claims.get(&(port, protocol)).cloned().flatten(),
        }
    }

    /// Reads the host socket tables and merges in `extra` (ports reserved by managed instances).
    pub async fn capture(extra: impl IntoIterator<Item = PortClaim>) -> Self {
        let mut snap = Self::empty();
        let mut read_any = false;

        for (path, protocol, listen_only) in [
            ("/proc/net/tcp", Protocol::Tcp, true),
            ("/proc/net/tcp6", Protocol::Tcp, true),
            ("/proc/net/udp", Protocol::Udp, false),
            ("/proc/net/udp6", Protocol::Udp, false),
        ] {
            let Ok(text) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            read_any = true;
            for port in parse_proc_net(&text, listen_only) {
                snap.claim(port, protocol, None);
            }
        }

        snap.extend(extra);
        if !read_any {
            // No socket table on this platform: fall back to test binds.
            snap.probe_host = true;
        }
        snap
    }
}

/// Extracts local ports from a `/proc/net/{tcp,udp}[6]` table.
fn parse_proc_net(text: &str, listen_only: bool) -> Vec<u16> {
    const TCP_LISTEN: &str = "0A";

    let mut out = Vec::new();
    for line in text.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let _slot = cols.next();
        let Some(local) = cols.next() else {
            continue;
        };
        let _remote = cols.next();
        let Some(state) = cols.next() else {
            continue;
        };
        if listen_only && state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16)
            && port != 0
        {
            out.push(port);
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn bind_probe(port: u16, protocol: Protocol) -> bool {
    let res = match protocol {
        Protocol::Tcp => TcpListener::bind(("0.0.0.0", port)).map(|_| ()),
        Protocol::Udp => UdpSocket::bind(("0.0.0.0", port)).map(|_| ()),
    };
    match res {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        // Permission errors etc. mean we cannot use it either.
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Candidates from `from` to the end of the range, then past the range up to 65535.
    fn candidates(&self, from: u16) -> impl Iterator<Item = u16> {
        let end = self.range.end;
        let in_range = if from <= end { from..=end } else { 1..=0 };
        let beyond = if from <= end {
            end.saturating_add(1).max(1)..=u16::MAX
        } else {
            from..=u16::MAX
        };
        let overflow_empty = end == u16::MAX && from <= end;
        in_range.chain(beyond.filter(move |_| !overflow_empty))
    }

    /// Picks one host port. A free preferred port is always returned as-is.
    pub fn allocate_port(
        &self,
        snapshot: &PortSnapshot,
        protocol: Protocol,
        preferred: Option<u16>,
        allow_fallback: bool,
    ) -> Result<u16> {
        let preferred = preferred.filter(|p| *p != 0);
        let from = match preferred {
            Some(p) => {
                if !snapshot.is_bound(p, protocol) {
                    return Ok(p);
                }
                if !allow_fallback {
                    return Err(RuntimeError::PortConflict(vec![
                        snapshot.claim_for(p, protocol),
                    ]));
                }
                self.range.start.max(p.saturating_add(1))
            }
            None => self.range.start,
        };

        if let Some(port) = self
            .candidates(from)
            .find(|p| !snapshot.is_bound(*p, protocol))
        {
            return Ok(port);
        }

        Err(RuntimeError::NoPortsAvailable {
            start: from,
            end: self.range.end,
            conflicts: preferred
                .map(|p| vec![snapshot.claim_for(p, protocol)])
                .unwrap_or_default(),
        })
    }

    /// Allocates every requested port at its fixed offset from one base, or nothing at all.
    ///
    /// Offsets are taken relative to the first request's container port. An explicit base is
    /// strict for blocks of two or more ports: the whole block must be free there.
    pub fn allocate_block(
        &self,
        snapshot: &PortSnapshot,
        requests: &[PortRequest],
        preferred_base: Option<u16>,
        allow_fallback: bool,
    ) -> Result<Vec<PortBinding>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        for r in requests {
            if r.container_port == 0 {
                return Err(RuntimeError::invalid("ports", "container port must be 1-65535"));
            }
            if !seen.insert((r.container_port, r.protocol)) {
                return Err(RuntimeError::invalid(
                    "ports",
                    format!("duplicate port {}/{}", r.container_port, r.protocol),
                ));
            }
        }

        let preferred_base = preferred_base.filter(|p| *p != 0);

        if requests.len() == 1 {
            let host =
                self.allocate_port(snapshot, first.protocol, preferred_base, allow_fallback)?;
            return Ok(vec![PortBinding {
                container_port: first.container_port,
                protocol: first.protocol,
                host_port: Some(host),
            }]);
        }

        let offsets: Vec<(i32, Protocol)> = requests
            .iter()
            .map(|r| (r.container_port as i32 - first.container_port as i32, r.protocol))
            .collect();
        let min_off = offsets.iter().map(|(o, _)| *o).min().unwrap_or(0);
        let max_off = offsets.iter().map(|(o, _)| *o).max().unwrap_or(0);
        let base_fits = |base: u16| {
            let b = base as i32;
            b + min_off >= 1 && b + max_off <= u16::MAX as i32
        };

        let conflicts_at = |base: u16| -> Vec<PortClaim> {
            offsets
                .iter()
                .filter_map(|(off, proto)| {
                    let port = (base as i32 + off) as u16;
                    snapshot
                        .is_bound(port, *proto)
                        .then(|| snapshot.claim_for(port, *proto))
                })
                .collect()
        };

        let bindings_at = |base: u16| -> Vec<PortBinding> {
            requests
                .iter()
                .zip(offsets.iter())
                .map(|(r, (off, _))| PortBinding {
                    container_port: r.container_port,
                    protocol: r.protocol,
                    host_port: Some((base as i32 + off) as u16),
                })
                .collect()
        };

        if let Some(base) = preferred_base {
            if !base_fits(base) {
                return Err(RuntimeError::invalid(
                    "preferred_host_port",
                    format!("port block does not fit at base {base}"),
                ));
            }
            let conflicts = conflicts_at(base);
            if conflicts.is_empty() {
                return Ok(bindings_at(base));
            }
            return Err(RuntimeError::PortConflict(conflicts));
        }

        let mut last_conflicts = Vec::new();
        for base in self.candidates(self.range.start).filter(|b| base_fits(*b)) {
            let conflicts = conflicts_at(base);
            if conflicts.is_empty() {
                return Ok(bindings_at(base));
            }
            last_conflicts = conflicts;
        }

        Err(RuntimeError::NoPortsAvailable {
            start: self.range.start,
            end: self.range.end,
            conflicts: last_conflicts,
        })
    }
}

/// Host ports claimed by a set of bindings, for feeding back into a snapshot.
pub fn claims_from_bindings(owner: &str, bindings: &[PortBinding]) -> Vec<PortClaim> {
    bindings
        .iter()
        .filter_map(|b| {
            b.host_port.map(|port| PortClaim {
                port,
                protocol: b.protocol,
                owner: Some(owner.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_model::ErrorKind;

    fn allocator() -> PortAllocator {
        PortAllocator::new(PortRange {
            start: 25565,
            end: 25575,
        })
    }

    #[test]
    fn preferred_port_is_returned_when_free() {
        let snap = PortSnapshot::empty();
        let port = allocator()
            .allocate_port(&snap, Protocol::Tcp, Some(25570), false)
            .unwrap();
        assert_eq!(port, 25570);
    }

    #[test]
    fn preferred_conflict_then_fallback_scenario() {
        let alloc = allocator();
        let req = [PortRequest::tcp(25565)];

        let mut snap = PortSnapshot::empty();
        let first = alloc.allocate_block(&snap, &req, Some(25565), false).unwrap();
        assert_eq!(first[0].host_port, Some(25565));

        snap.extend(claims_from_bindings("lobby", &first));
        let err = alloc
            .allocate_block(&snap, &req, Some(25565), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortConflict);
        assert!(err.to_string().contains("25565/tcp"));

        let second = alloc.allocate_block(&snap, &req, Some(25565), true).unwrap();
        assert_eq!(second[0].host_port, Some(25566));
    }

    #[test]
    fn protocols_are_independent_namespaces() {
        let mut snap = PortSnapshot::empty();
        snap.claim(25565, Protocol::Tcp, None);
        let port = allocator()
            .allocate_port(&snap, Protocol::Udp, Some(25565), false)
            .unwrap();
        assert_eq!(port, 25565);
    }

    #[test]
    fn scan_extends_past_range_only_when_exhausted() {
        let mut snap = PortSnapshot::empty();
        for p in 25565..=25575 {
            snap.claim(p, Protocol::Tcp, None);
        }
        let port = allocator()
            .allocate_port(&snap, Protocol::Tcp, None, true)
            .unwrap();
        assert_eq!(port, 25576);
    }

    #[test]
    fn fallback_scans_upward_from_preferred() {
        let mut snap = PortSnapshot::empty();
        snap.claim(25570, Protocol::Tcp, None);
        snap.claim(25571, Protocol::Tcp, None);
        let port = allocator()
            .allocate_port(&snap, Protocol::Tcp, Some(25570), true)
            .unwrap();
        assert_eq!(port, 25572);
    }

    #[test]
    fn block_keeps_offsets_from_one_base() {
        let mut snap = PortSnapshot::empty();
        // Blocks base 25565 (offset +3) and base 25566 (offset +10 -> 25576).
        snap.claim(25568, Protocol::Udp, None);
        snap.claim(25576, Protocol::Tcp, None);
        let req = [
            PortRequest::udp(7777),
            PortRequest::udp(7780),
            PortRequest::tcp(7787),
        ];
        let out = allocator().allocate_block(&snap, &req, None, true).unwrap();
        let base = out[0].host_port.unwrap();
        assert_eq!(base, 25567);
        assert_eq!(out[1].host_port, Some(base + 3));
        assert_eq!(out[2].host_port, Some(base + 10));
        for b in &out {
            assert!(!snap.is_bound(b.host_port.unwrap(), b.protocol));
        }
    }

    #[test]
    fn strict_block_base_names_every_conflict() {
        let mut snap = PortSnapshot::empty();
        snap.claim(26003, Protocol::Udp, Some("dst-a".to_string()));
        snap.claim(26010, Protocol::Tcp, None);
        let req = [
            PortRequest::udp(7777),
            PortRequest::udp(7780),
            PortRequest::tcp(7787),
        ];
        let err = allocator()
            .allocate_block(&snap, &req, Some(26000), true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortConflict);
        let conflicts = err.conflicts();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].port, 26003);
        assert_eq!(conflicts[0].owner.as_deref(), Some("dst-a"));
        assert_eq!(conflicts[1].port, 26010);
    }

    #[test]
    fn exhausted_block_scan_reports_last_collisions() {
        let mut snap = PortSnapshot::empty();
        snap.claim(u16::MAX, Protocol::Tcp, Some("edge".to_string()));
        // The offset leaves 25565 as the only base that fits.
        let req = [PortRequest::tcp(1), PortRequest::tcp(39971)];
        let err = allocator()
            .allocate_block(&snap, &req, None, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPortsAvailable);
        let conflicts = err.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].port, u16::MAX);
        assert_eq!(conflicts[0].owner.as_deref(), Some("edge"));
    }

    #[test]
    fn released_bindings_are_free_unless_held_by_another_owner() {
        let mut snap = PortSnapshot::empty();
        snap.claim(25565, Protocol::Tcp, None);
        snap.extend(claims_from_bindings("alpha", &[PortBinding {
            container_port: 25565,
            protocol: Protocol::Tcp,
            host_port: Some(25565),
        }]));
        snap.claim(25566, Protocol::Tcp, Some("beta".to_string()));

        snap.release("alpha", &[
            PortBinding {
                container_port: 25565,
                protocol: Protocol::Tcp,
                host_port: Some(25565),
            },
            PortBinding {
                container_port: 25566,
                protocol: Protocol::Tcp,
                host_port: Some(25566),
            },
        ]);
        assert!(!snap.is_bound(25565, Protocol::Tcp));
        assert!(snap.is_bound(25566, Protocol::Tcp));
    }

    #[test]
    fn block_rejects_duplicate_requests() {
        let req = [PortRequest::tcp(25565), PortRequest::tcp(25565)];
        let err = allocator()
            .allocate_block(&PortSnapshot::empty(), &req, None, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn allocations_never_share_a_pair() {
        let alloc = allocator();
        let mut snap = PortSnapshot::empty();
        let mut seen = HashSet::new();
        for _ in 0..8 {
            let out = alloc
                .allocate_block(
                    &snap,
                    &[PortRequest::tcp(25565), PortRequest::udp(25565)],
                    None,
                    true,
                )
                .unwrap();
            for b in &out {
                assert!(seen.insert((b.host_port.unwrap(), b.protocol)));
            }
            snap.extend(claims_from_bindings("x", &out));
        }
    }

    #[test]
    fn parse_proc_net_keeps_tcp_listeners_only() {
        let text = "  sl  local_address rem_address   st tx_queue rx_queue\n\
   0: 00000000:63DD 00000000:0000 0A 00000000:00000000 00:00000000 00000000\n\
   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000\n";
        assert_eq!(parse_proc_net(text, true), vec![25565]);
        assert_eq!(parse_proc_net(text, false), vec![8080, 25565]);
    }
}
