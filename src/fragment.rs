//! Sub-package reassembly.
//!
//! Parts are grouped by `(device id, message id, total parts)` and joined in
//! index order once every index `1..=total` has arrived. Groups live in a
//! `DashMap` so parts arriving on different connections or UDP workers meet
//! in the same group. A group that receives nothing for the configured
//! timeout is dropped by [`FragmentReassembler::sweep_expired`] and reported
//! as `FragmentTimeout`. Parts announcing more than the configured maximum
//! total are rejected before any group is created, which bounds the memory
//! a single group can hold.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use jt808_core::fragment::{FragmentReassembler, Reassembly};
//! use jt808_core::protocol::{DeviceId, Header};
//!
//! let reassembler = FragmentReassembler::default();
//! let device = DeviceId::new("013912345678").unwrap();
//! let part = |index| Header::new(0x0801, device.clone(), index).with_fragment(2, index);
//!
//! let first = reassembler.accept(&device, &part(2), Bytes::from_static(b"world")).unwrap();
//! assert!(matches!(first, Reassembly::Pending { received: 1, total: 2 }));
//!
//! match reassembler.accept(&device, &part(1), Bytes::from_static(b"hello ")).unwrap() {
//!     Reassembly::Complete(packet) => assert_eq!(&packet.body[..], b"hello world"),
//!     Reassembly::Pending { .. } => unreachable!(),
//! }
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::codec::Packet;
use crate::error::{Jt808Error, Result};
use crate::protocol::{DeviceId, Header};

/// Default time a group may go without receiving a part.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default largest `total` accepted for one fragmented message.
pub const DEFAULT_MAX_FRAGMENT_PARTS: u16 = 256;

/// Identity of one logical fragmented message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub device_id: DeviceId,
    pub message_id: u16,
    pub total: u16,
}

/// Outcome of accepting one part.
#[derive(Debug)]
pub enum Reassembly {
    /// All parts present; header is part 1's with fragment info cleared.
    Complete(Packet),
    /// Still waiting for parts.
    Pending { received: usize, total: u16 },
}

/// Parts received so far for one key.
struct FragmentGroup {
    parts: BTreeMap<u16, (Header, Bytes)>,
    last_update: Instant,
}

impl FragmentGroup {
    fn new(now: Instant) -> Self {
        Self {
            parts: BTreeMap::new(),
            last_update: now,
        }
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > timeout
    }

    fn is_complete(&self, total: u16) -> bool {
        self.parts.len() == usize::from(total)
    }

    /// Join the parts in index order, or give the group back if it is empty.
    fn join(self) -> std::result::Result<Packet, Self> {
        let body_len: usize = self.parts.values().map(|(_, body)| body.len()).sum();
        let last_update = self.last_update;
        let mut parts = self.parts.into_values();
        let Some((mut header, first)) = parts.next() else {
            return Err(FragmentGroup::new(last_update));
        };

        let mut body = BytesMut::with_capacity(body_len);
        body.extend_from_slice(&first);
        for (_, part) in parts {
            body.extend_from_slice(&part);
        }

        header.fragment = None;
        header.body_length = body.len();
        Ok(Packet {
            header,
            body: body.freeze(),
        })
    }
}

/// Concurrent buffer of incomplete fragment groups.
pub struct FragmentReassembler {
    groups: DashMap<FragmentKey, FragmentGroup>,
    timeout: Duration,
    max_parts: u16,
}

impl FragmentReassembler {
    /// Create a reassembler with the given inactivity timeout and
    /// [`DEFAULT_MAX_FRAGMENT_PARTS`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            timeout,
            max_parts: DEFAULT_MAX_FRAGMENT_PARTS,
        }
    }

    /// Set the largest `total` a fragmented message may announce.
    pub fn with_max_parts(mut self, max_parts: u16) -> Self {
        self.max_parts = max_parts;
        self
    }

    /// Inactivity timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Largest accepted `total`.
    pub fn max_parts(&self) -> u16 {
        self.max_parts
    }

    /// Accept one part.
    ///
    /// A header without fragment info passes straight through as `Complete`.
    /// A repeated index overwrites the stored part.
    ///
    /// # Errors
    ///
    /// `InvalidFragment` for total 0, index 0, index beyond total, or a
    /// total above [`max_parts`](Self::max_parts).
    pub fn accept(
        &self,
        device_id: &DeviceId,
        header: &Header,
        body: Bytes,
    ) -> Result<Reassembly> {
        self.accept_at(device_id, header, body, Instant::now())
    }

    /// [`accept`](Self::accept) with an explicit clock.
    pub fn accept_at(
        &self,
        device_id: &DeviceId,
        header: &Header,
        body: Bytes,
        now: Instant,
    ) -> Result<Reassembly> {
        let Some(info) = header.fragment else {
            return Ok(Reassembly::Complete(Packet {
                header: header.clone(),
                body,
            }));
        };
        if info.total == 0
            || info.index == 0
            || info.index > info.total
            || info.total > self.max_parts
        {
            return Err(Jt808Error::InvalidFragment {
                index: info.index,
                total: info.total,
            });
        }

        let key = FragmentKey {
            device_id: device_id.clone(),
            message_id: header.message_id,
            total: info.total,
        };

        match self.groups.entry(key) {
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                if group.is_expired(now, self.timeout) {
                    tracing::debug!(
                        "Restarting stale fragment group {:#06x} from {}",
                        header.message_id,
                        device_id
                    );
                    *group = FragmentGroup::new(now);
                }
                group.parts.insert(info.index, (header.clone(), body));
                group.last_update = now;

                if group.is_complete(info.total) {
                    match occupied.remove().join() {
                        Ok(packet) => Ok(Reassembly::Complete(packet)),
                        Err(_) => Ok(Reassembly::Pending {
                            received: 0,
                            total: info.total,
                        }),
                    }
                } else {
                    Ok(Reassembly::Pending {
                        received: group.parts.len(),
                        total: info.total,
                    })
                }
            }
            Entry::Vacant(vacant) => {
                let mut group = FragmentGroup::new(now);
                group.parts.insert(info.index, (header.clone(), body));
                if group.is_complete(info.total) {
                    match group.join() {
                        Ok(packet) => return Ok(Reassembly::Complete(packet)),
                        Err(empty) => group = empty,
                    }
                }
                vacant.insert(group);
                Ok(Reassembly::Pending {
                    received: 1,
                    total: info.total,
                })
            }
        }
    }

    /// Drop groups idle past the timeout.
    pub fn sweep_expired(&self) -> Vec<Jt808Error> {
        self.sweep_expired_at(Instant::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) with an explicit clock.
    ///
    /// Returns one `FragmentTimeout` per dropped group.
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<Jt808Error> {
        let mut expired = Vec::new();
        self.groups.retain(|key, group| {
            if !group.is_expired(now, self.timeout) {
                return true;
            }
            expired.push(Jt808Error::FragmentTimeout {
                device_id: key.device_id.to_string(),
                message_id: key.message_id,
                total: key.total,
                received: group.parts.len(),
            });
            false
        });
        expired
    }

    /// Number of incomplete groups held.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAGMENT_TIMEOUT)
    }
}
