//! Ordered stream of pushed packets.
//!
//! The stream owns the process-wide generation counter. It is initialized
//! once when the writer opens, from the last generation the writer knows
//! about, and every push takes the next value with a single atomic
//! increment.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::pool::{ReaderPool, ReadersAndUpdates};
use crate::segment::SegmentCommitInfo;
use crate::update::{ApplyResult, FrozenBufferedUpdates};

/// Tracks packets from push until they have been applied everywhere.
#[derive(Debug)]
pub struct BufferedUpdatesStream {
    next_gen: AtomicI64,
    in_flight: Mutex<Vec<Arc<FrozenBufferedUpdates>>>,
    /// Generations finished out of order, waiting for older ones.
    finished: Mutex<BTreeSet<i64>>,
    completed_del_gen: AtomicI64,
    bytes_used: AtomicU64,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BufferedUpdatesStream {
    /// Stream whose first push receives `last_gen + 1`.
    pub fn new(last_gen: i64) -> Self {
        BufferedUpdatesStream {
            next_gen: AtomicI64::new(last_gen + 1),
            in_flight: Mutex::new(Vec::new()),
            finished: Mutex::new(BTreeSet::new()),
            completed_del_gen: AtomicI64::new(last_gen),
            bytes_used: AtomicU64::new(0),
        }
    }

    /// Stamp `packet` with the next generation and start tracking it.
    pub fn push(&self, packet: FrozenBufferedUpdates) -> Result<Arc<FrozenBufferedUpdates>> {
        let packet = Arc::new(packet);
        let mut in_flight = self.in_flight.lock();
        // Assign under the lock so in-flight packets stay in generation order.
        let generation = self.next_gen.fetch_add(1, Ordering::AcqRel);
        packet.set_del_gen(generation)?;
        in_flight.push(Arc::clone(&packet));
        self.bytes_used.fetch_add(packet.ram_bytes_used(), Ordering::Relaxed);

        log::debug!(
            "push packet generation={generation}: {} term deletes, {} queries, {} field updates{}; {} in flight",
            packet.num_term_deletes(),
            packet.num_delete_queries(),
            packet.num_field_updates(),
            packet
                .private_segment()
                .map(|id| format!(", private to {id}"))
                .unwrap_or_default(),
            in_flight.len()
        );
        Ok(packet)
    }

    /// Generation of the most recent push.
    ///
    /// Segments created after that push already contain its effect and
    /// should carry this value as their buffered-deletes generation.
    pub fn last_gen(&self) -> i64 {
        self.next_gen.load(Ordering::Acquire) - 1
    }

    /// Stop tracking a packet that has been applied everywhere it needs to be.
    pub fn finished(&self, packet: &FrozenBufferedUpdates) {
        let generation = packet.del_gen();
        {
            let mut in_flight = self.in_flight.lock();
            let before = in_flight.len();
            in_flight.retain(|p| p.del_gen() != generation);
            if in_flight.len() == before {
                return;
            }
        }
        self.bytes_used.fetch_sub(packet.ram_bytes_used(), Ordering::Relaxed);

        let mut finished = self.finished.lock();
        finished.insert(generation);
        let mut completed = self.completed_del_gen.load(Ordering::Acquire);
        while finished.remove(&(completed + 1)) {
            completed += 1;
        }
        self.completed_del_gen.store(completed, Ordering::Release);
    }

    /// Every packet up to this generation has finished.
    pub fn completed_del_gen(&self) -> i64 {
        self.completed_del_gen.load(Ordering::Acquire)
    }

    pub fn any_changes(&self) -> bool {
        !self.in_flight.lock().is_empty()
    }

    pub fn pending_updates_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// Apply every in-flight packet, oldest first, to the segments `infos`
    /// describes.
    ///
    /// Each segment's registry entry is held for the duration and released
    /// afterwards, even when applying fails. A packet stays in flight until
    /// every segment the pool knows about reflects it, so a call covering
    /// only some segments leaves it for a later call over the rest.
    pub fn apply_all(&self, pool: &ReaderPool, infos: &[SegmentCommitInfo]) -> Result<ApplyResult> {
        let packets: Vec<Arc<FrozenBufferedUpdates>> = self.in_flight.lock().clone();
        if packets.is_empty() {
            return Ok(ApplyResult::default());
        }

        let mut targets: Vec<Arc<ReadersAndUpdates>> = Vec::with_capacity(infos.len());
        let mut result = (|| -> Result<ApplyResult> {
            for info in infos {
                if let Some(entry) = pool.get(info, true)? {
                    targets.push(entry);
                }
            }
            let mut total = ApplyResult::default();
            for packet in &packets {
                total.merge(packet.apply(&targets)?);
            }
            Ok(total)
        })();

        for target in &targets {
            if let Err(err) = pool.release(target) {
                log::warn!("failed to release segment {} after apply: {err}", target.id());
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if result.is_ok() {
            let infos = pool.segment_infos();
            for packet in &packets {
                if is_reflected_by_all(packet, &infos) {
                    self.finished(packet);
                } else {
                    log::trace!("packet {} stays in flight for unvisited segments", packet.del_gen());
                }
            }
        }
        result
    }
}

/// Whether every segment `packet` targets already reflects it.
fn is_reflected_by_all(packet: &FrozenBufferedUpdates, infos: &[SegmentCommitInfo]) -> bool {
    let generation = packet.del_gen();
    infos.iter().all(|info| {
        info.buffered_deletes_gen() >= generation
            || packet.private_segment().is_some_and(|private| private != info.id())
    })
}
