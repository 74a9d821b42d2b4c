//! Fragment Reassembly Buffer (spec.md §4.5 receive path, §4.6).
//!
//! Grounded on the teacher's `Buffer` (`neutronium/src/net/buffer.rs`) for
//! the general shape of "a small fixed pool of byte buffers with explicit
//! occupancy and capacity bookkeeping," regeneralized from a single
//! streaming FIFO into `zt_recvq` (2) independent per-message slots with a
//! missing-fragment bitmap, since message reassembly (not byte streaming) is
//! what spec.md's pipe receive path needs.

use std::time::{Duration, Instant};

/// Per-pipe reassembly slot count (spec.md §4.6).
pub const RECVQ_SLOTS: usize = 2;

/// Staleness threshold before a slot is evicted and reused (spec.md §4.6).
pub const RECV_STALE: Duration = Duration::from_millis(1000);

/// Result of ingesting one `data`/`data-more` fragment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IngestOutcome {
    /// Stored, message still incomplete.
    Accepted,
    /// Stored, and this was the last missing fragment — a message is now
    /// ready for [`ReassemblyBuffer::take_ready`].
    Ready,
    /// This fragment's bit was already clear; silently ignored.
    Duplicate,
    /// Fragment geometry is inconsistent with the slot or the receive cap —
    /// caller must close the pipe with a protocol error.
    ProtocolError,
    /// The fragment declares a message larger than the configured receive
    /// cap; rejected before any slot work happens.
    TooLarge,
}

struct Slot {
    occupied: bool,
    msg_id: u16,
    n_frags: u16,
    frag_size: u16,
    arrived_at: Instant,
    missing: Vec<u8>,
    buffer: Vec<u8>,
    ready: bool,
}

impl Slot {
    fn empty(now: Instant) -> Slot {
        Slot {
            occupied: false,
            msg_id: 0,
            n_frags: 0,
            frag_size: 0,
            arrived_at: now,
            missing: Vec::new(),
            buffer: Vec::new(),
            ready: false,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.occupied = false;
        self.ready = false;
        self.missing.clear();
        self.buffer.clear();
        self.arrived_at = now;
    }

    fn init(&mut self, now: Instant, msg_id: u16, n_frags: u16, frag_size: u16) {
        self.occupied = true;
        self.ready = false;
        self.msg_id = msg_id;
        self.n_frags = n_frags;
        self.frag_size = frag_size;
        self.arrived_at = now;
        self.buffer = vec![0u8; n_frags as usize * frag_size as usize];

        let mask_bytes = (n_frags as usize + 7) / 8;
        self.missing = vec![0xFFu8; mask_bytes];
        // Mask off bits beyond n_frags in the last byte.
        let used_bits_in_last_byte = n_frags as usize % 8;
        if used_bits_in_last_byte != 0 && mask_bytes > 0 {
            let keep = (1u16 << used_bits_in_last_byte) - 1;
            self.missing[mask_bytes - 1] = keep as u8;
        }
    }

    fn is_bit_set(&self, frag_no: u16) -> bool {
        let (byte, bit) = (frag_no as usize / 8, frag_no as usize % 8);
        (self.missing[byte] & (1 << bit)) != 0
    }

    fn clear_bit(&mut self, frag_no: u16) {
        let (byte, bit) = (frag_no as usize / 8, frag_no as usize % 8);
        self.missing[byte] &= !(1 << bit);
    }

    fn missing_count(&self) -> u32 {
        self.missing.iter().map(|b| b.count_ones()).sum()
    }

    fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }
}

/// Bounded per-pipe message reassembly state.
pub struct ReassemblyBuffer {
    slots: Vec<Slot>,
    receive_cap: u32,
}

impl ReassemblyBuffer {
    pub fn new(now: Instant, receive_cap: u32) -> ReassemblyBuffer {
        ReassemblyBuffer {
            slots: (0..RECVQ_SLOTS).map(|_| Slot::empty(now)).collect(),
            receive_cap,
        }
    }

    /// Ingests one fragment, implementing spec.md §4.5 steps 3–9.
    pub fn ingest(
        &mut self,
        now: Instant,
        msg_id: u16,
        frag_size: u16,
        frag_no: u16,
        n_frags: u16,
        payload: &[u8],
    ) -> IngestOutcome {
        if frag_size == 0 {
            return IngestOutcome::ProtocolError;
        }
        if (n_frags as u64) * (frag_size as u64) >= self.receive_cap as u64 + frag_size as u64 {
            return IngestOutcome::TooLarge;
        }
        if frag_no >= n_frags {
            return IngestOutcome::ProtocolError;
        }

        // Step 3: evict stale slots.
        for slot in self.slots.iter_mut() {
            if slot.occupied && now.duration_since(slot.arrived_at) > RECV_STALE {
                slot.reset(now);
            }
        }

        // Step 4: slot selection — first matching msg_id, else the least
        // recently used slot (an unoccupied slot always counts as oldest).
        let selected = self
            .slots
            .iter()
            .position(|s| s.occupied && s.msg_id == msg_id)
            .or_else(|| self.slots.iter().position(|s| !s.occupied))
            .unwrap_or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.arrived_at)
                    .map(|(i, _)| i)
                    .expect("slots is never empty")
            });

        let slot = &mut self.slots[selected];

        // Step 5: reinitialize if empty or a different message.
        if !slot.occupied || slot.msg_id != msg_id {
            slot.init(now, msg_id, n_frags, frag_size);
        } else if slot.n_frags != n_frags || slot.frag_size != frag_size {
            // Step 6: consistency check against the slot's recorded geometry.
            slot.reset(now);
            return IngestOutcome::ProtocolError;
        }

        let is_final = frag_no == n_frags - 1;
        if !is_final && payload.len() != frag_size as usize {
            slot.reset(now);
            return IngestOutcome::ProtocolError;
        }

        // Step 7: duplicate suppression.
        if !slot.is_bit_set(frag_no) {
            return IngestOutcome::Duplicate;
        }

        // Step 8: copy payload, clear bit.
        let offset = frag_no as usize * frag_size as usize;
        let copy_len = payload.len().min(slot.buffer.len().saturating_sub(offset));
        slot.buffer[offset..offset + copy_len].copy_from_slice(&payload[..copy_len]);
        slot.clear_bit(frag_no);

        if is_final {
            let final_len = (n_frags as usize - 1) * frag_size as usize + payload.len();
            if final_len > self.receive_cap as usize {
                slot.reset(now);
                return IngestOutcome::ProtocolError;
            }
            slot.buffer.truncate(final_len);
        }

        // Step 9: ready check.
        if slot.is_complete() {
            slot.ready = true;
            IngestOutcome::Ready
        } else {
            IngestOutcome::Accepted
        }
    }

    /// First-ready-slot delivery (not oldest), per spec.md §4.5 "Delivery".
    pub fn take_ready(&mut self, now: Instant) -> Option<Vec<u8>> {
        let idx = self.slots.iter().position(|s| s.ready)?;
        let message = std::mem::take(&mut self.slots[idx].buffer);
        self.slots[idx].reset(now);
        Some(message)
    }

    #[cfg(test)]
    fn missing_count_for(&self, msg_id: u16) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.occupied && s.msg_id == msg_id)
            .map(Slot::missing_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_in_order() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 8192);
        let frags = [vec![1u8; 1480], vec![2u8; 1480], vec![3u8; 100]];
        for (i, f) in frags.iter().enumerate() {
            let outcome = buf.ingest(now, 1, 1480, i as u16, 3, f);
            if i == 2 {
                assert_eq!(outcome, IngestOutcome::Ready);
            } else {
                assert_eq!(outcome, IngestOutcome::Accepted);
            }
        }
        let msg = buf.take_ready(now).unwrap();
        assert_eq!(msg.len(), 1480 * 2 + 100);
        assert_eq!(&msg[0..1480], &frags[0][..]);
        assert_eq!(&msg[1480..2960], &frags[1][..]);
        assert_eq!(&msg[2960..], &frags[2][..]);
    }

    #[test]
    fn reassembles_out_of_order() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 8192);
        let frag0 = vec![0xAAu8; 100];
        let frag1 = vec![0xBBu8; 100];
        let frag2 = vec![0xCCu8; 50];

        assert_eq!(buf.ingest(now, 9, 100, 2, 3, &frag2), IngestOutcome::Accepted);
        assert_eq!(buf.ingest(now, 9, 100, 0, 3, &frag0), IngestOutcome::Accepted);
        assert_eq!(buf.ingest(now, 9, 100, 1, 3, &frag1), IngestOutcome::Ready);

        let msg = buf.take_ready(now).unwrap();
        assert_eq!(&msg[0..100], &frag0[..]);
        assert_eq!(&msg[100..200], &frag1[..]);
        assert_eq!(&msg[200..250], &frag2[..]);
    }

    #[test]
    fn duplicate_fragment_is_dropped() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 8192);
        let frag = vec![1u8; 10];
        assert_eq!(buf.ingest(now, 1, 10, 0, 2, &frag), IngestOutcome::Accepted);
        assert_eq!(buf.ingest(now, 1, 10, 0, 2, &frag), IngestOutcome::Duplicate);
    }

    #[test]
    fn stale_slot_is_reused_without_leaking_data() {
        let t0 = Instant::now();
        let mut buf = ReassemblyBuffer::new(t0, 8192);
        assert_eq!(
            buf.ingest(t0, 0x1234, 10, 0, 2, &vec![1u8; 10]),
            IngestOutcome::Accepted
        );

        let t1 = t0 + Duration::from_millis(1500);
        // A second, unrelated slot stays available so selection doesn't need
        // eviction, but eviction must still run so 0x1234's partial state
        // cannot leak into a later reuse of the same slot index.
        let outcome = buf.ingest(t1, 0x5678, 10, 0, 1, &vec![9u8; 10]);
        assert_eq!(outcome, IngestOutcome::Ready);
        let msg = buf.take_ready(t1).unwrap();
        assert_eq!(msg, vec![9u8; 10]);
    }

    #[test]
    fn missing_count_matches_ingested_fragment_count() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 8192);
        buf.ingest(now, 4, 10, 0, 4, &vec![0u8; 10]);
        assert_eq!(buf.missing_count_for(4), Some(3));
        buf.ingest(now, 4, 10, 2, 4, &vec![0u8; 10]);
        assert_eq!(buf.missing_count_for(4), Some(2));
    }

    #[test]
    fn inconsistent_geometry_is_a_protocol_error() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 8192);
        assert_eq!(
            buf.ingest(now, 1, 10, 0, 2, &vec![0u8; 10]),
            IngestOutcome::Accepted
        );
        assert_eq!(
            buf.ingest(now, 1, 20, 1, 2, &vec![0u8; 20]),
            IngestOutcome::ProtocolError
        );
    }

    #[test]
    fn oversized_message_is_rejected_early() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(now, 100);
        assert_eq!(
            buf.ingest(now, 1, 1000, 0, 5, &vec![0u8; 1000]),
            IngestOutcome::TooLarge
        );
    }
}
