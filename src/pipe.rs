//! Pipe State Machine (spec.md §4.5).
//!
//! Grounded on `neutronium/src/net/channel.rs`'s `Channel` (buffer-backed
//! framing, `ChannelState` transitions, dense `trace!`/`debug!` logging
//! around every operation) minus its crypto/session handling, which is the
//! overlay library's job here and out of scope (spec.md §1). Kept as pure
//! data plus state-transition methods operating on that data; `Host`
//! supplies the "lock is held" capability and performs the actual frame
//! I/O, per the callback-holds-lock discipline in spec.md §9.

use std::time::Instant;

use slog::{debug, o, trace, Logger};

use crate::addr::{Addr, Nwid};
use crate::codec::{Frame, DATA_HEADER_LEN, HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::op::OpHandle;
use crate::reassembly::{IngestOutcome, ReassemblyBuffer};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PipeState {
    Live,
    Closing,
    Dead,
}

/// One established conversation (spec.md §3 "Pipe").
pub struct Pipe {
    pub local_addr: Addr,
    pub remote_addr: Addr,
    pub nwid: Nwid,
    pub mtu: u32,
    pub receive_cap: u32,
    pub peer_proto: u16,
    pub state: PipeState,
    next_msg_id: u16,
    reassembly: ReassemblyBuffer,
    pending_recv: Option<OpHandle<Vec<u8>>>,
    last_recv_at: Instant,
    log: Logger,
}

impl Pipe {
    pub fn new(
        local_addr: Addr,
        remote_addr: Addr,
        nwid: Nwid,
        mtu: u32,
        receive_cap: u32,
        peer_proto: u16,
        now: Instant,
        log: Logger,
    ) -> Pipe {
        let log = log.new(o!("local" => local_addr.to_string(), "remote" => remote_addr.to_string()));
        debug!(log, "pipe created"; "mtu" => mtu, "peer_proto" => peer_proto);
        Pipe {
            local_addr,
            remote_addr,
            nwid,
            mtu,
            receive_cap,
            peer_proto,
            state: PipeState::Live,
            next_msg_id: 1,
            reassembly: ReassemblyBuffer::new(now, receive_cap),
            pending_recv: None,
            last_recv_at: now,
            log,
        }
    }

    /// Fragment payload size: physical MTU less the fixed frame header and
    /// the data-frame's own header (spec.md §4.5: "fragsz = physical MTU -
    /// data header size", where the worked example in §8 scenario 1 makes
    /// clear that "data header size" is the full on-wire overhead of a data
    /// frame, fixed header plus data-specific header — MTU 1500 ⇒ 1480).
    pub fn frag_size(&self) -> u16 {
        (self.mtu.saturating_sub((HEADER_LEN + DATA_HEADER_LEN) as u32)) as u16
    }

    pub fn is_live(&self) -> bool {
        self.state == PipeState::Live
    }

    fn next_msg_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = if self.next_msg_id == u16::MAX {
            1 // skip zero on wrap
        } else {
            self.next_msg_id + 1
        };
        id
    }

    /// Splits `payload` into the `data`/`data-more` frames to emit for one
    /// `send(op)` call (spec.md §4.5 send path). Pure: does not touch I/O.
    pub fn build_send_frames(&mut self, payload: &[u8]) -> Result<Vec<Frame>> {
        if !self.is_live() {
            return Err(TransportError::Closed);
        }

        let fragsz = self.frag_size();
        if fragsz == 0 {
            return Err(TransportError::Internal("mtu too small for data header"));
        }
        let fragsz_usize = fragsz as usize;

        if payload.len() as u64 >= 0xfffe_u64 * fragsz as u64 {
            return Err(TransportError::MessageTooLarge);
        }

        let n_frags = ((payload.len() + fragsz_usize - 1) / fragsz_usize).max(1) as u16;
        let msg_id = self.next_msg_id();

        trace!(self.log, "building send frames"; "msg_id" => msg_id, "n_frags" => n_frags, "len" => payload.len());

        let mut frames = Vec::with_capacity(n_frags as usize);
        for frag_no in 0..n_frags {
            let start = frag_no as usize * fragsz_usize;
            let end = (start + fragsz_usize).min(payload.len());
            let chunk = &payload[start..end];
            let more = frag_no + 1 < n_frags;
            frames.push(Frame::Data {
                dest_port: self.remote_addr.port(),
                src_port: self.local_addr.port(),
                more,
                msg_id,
                frag_size: fragsz,
                frag_no,
                n_frags,
                payload: chunk.to_vec(),
            });
        }
        Ok(frames)
    }

    /// Registers a pending receive operation. If a message is already
    /// reassembled and ready, completes it immediately and returns `true`;
    /// otherwise stores the handle for later delivery.
    pub fn recv(&mut self, now: Instant, handle: OpHandle<Vec<u8>>) {
        if let Some(message) = self.reassembly.take_ready(now) {
            handle.complete(Ok(message));
            return;
        }
        self.pending_recv = Some(handle);
    }

    /// Ingests one `data`/`data-more` frame (spec.md §4.5 steps 2–9).
    /// Delivers to the pending receive op immediately if this fragment
    /// completes a message and an op is waiting.
    pub fn on_data_frame(
        &mut self,
        now: Instant,
        msg_id: u16,
        frag_size: u16,
        frag_no: u16,
        n_frags: u16,
        payload: &[u8],
    ) -> IngestOutcome {
        self.last_recv_at = now;
        let outcome = self
            .reassembly
            .ingest(now, msg_id, frag_size, frag_no, n_frags, payload);

        match outcome {
            IngestOutcome::Ready => {
                trace!(self.log, "message reassembled"; "msg_id" => msg_id);
                if let Some(handle) = self.pending_recv.take() {
                    if let Some(message) = self.reassembly.take_ready(now) {
                        handle.complete(Ok(message));
                    }
                }
            }
            IngestOutcome::ProtocolError => {
                debug!(self.log, "fragment protocol error, closing pipe"; "msg_id" => msg_id);
                self.fail_pending_and_close(TransportError::ProtocolError("bad fragment geometry"));
            }
            IngestOutcome::TooLarge => {
                debug!(self.log, "fragment declares oversized message, closing pipe"; "msg_id" => msg_id);
                self.fail_pending_and_close(TransportError::MessageTooLarge);
            }
            IngestOutcome::Accepted | IngestOutcome::Duplicate => {}
        }
        outcome
    }

    pub fn last_recv_at(&self) -> Instant {
        self.last_recv_at
    }

    pub fn touch_ping(&mut self, now: Instant) {
        self.last_recv_at = now;
    }

    /// `disc-req` ingest: fail any pending receive with `closed`, mark dead.
    pub fn on_disc_req(&mut self) {
        debug!(self.log, "peer sent disc-req");
        self.fail_pending_and_close(TransportError::Closed);
    }

    fn fail_pending_and_close(&mut self, err: TransportError) {
        if let Some(handle) = self.pending_recv.take() {
            handle.complete(Err(err));
        }
        self.state = PipeState::Closing;
    }

    /// Explicit close: fail pending receive with `closed`; caller is
    /// responsible for emitting `disc-req` to the peer (best effort) and
    /// releasing registry/port state.
    pub fn close(&mut self) {
        debug!(self.log, "pipe closing");
        if let Some(handle) = self.pending_recv.take() {
            handle.complete(Err(TransportError::Closed));
        }
        self.state = PipeState::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::discard;

    fn make_pipe(mtu: u32, receive_cap: u32) -> Pipe {
        Pipe::new(
            Addr::new(1, 0x800001),
            Addr::new(2, 7),
            0xdead,
            mtu,
            receive_cap,
            1,
            Instant::now(),
            discard(),
        )
    }

    #[test]
    fn splits_send_into_expected_fragment_count() {
        let mut pipe = make_pipe(1500, 1 << 20);
        let payload = vec![0xABu8; 4096];
        let frames = pipe.build_send_frames(&payload).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(pipe.frag_size(), 1480);
    }

    #[test]
    fn rejects_oversized_message() {
        let mut pipe = make_pipe(1500, 1 << 20);
        let fragsz = pipe.frag_size() as u64;
        let huge = vec![0u8; (0xfffe * fragsz) as usize];
        assert!(matches!(
            pipe.build_send_frames(&huge),
            Err(TransportError::MessageTooLarge)
        ));
    }

    #[test]
    fn send_rejected_when_not_live() {
        let mut pipe = make_pipe(1500, 1 << 20);
        pipe.close();
        assert!(matches!(
            pipe.build_send_frames(b"hi"),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn receive_delivers_immediately_when_already_ready() {
        let mut pipe = make_pipe(1500, 1 << 20);
        let now = Instant::now();
        let fragsz = pipe.frag_size();
        pipe.on_data_frame(now, 1, fragsz, 0, 1, &vec![1u8; 10]);

        let (op, handle) = crate::op::pair::<Vec<u8>>();
        pipe.recv(now, handle);
        assert_eq!(op.wait().unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn receive_waits_then_completes_on_arrival() {
        let mut pipe = make_pipe(1500, 1 << 20);
        let now = Instant::now();
        let (op, handle) = crate::op::pair::<Vec<u8>>();
        pipe.recv(now, handle);

        let fragsz = pipe.frag_size();
        pipe.on_data_frame(now, 1, fragsz, 0, 1, &vec![2u8; 5]);
        assert_eq!(op.wait().unwrap(), vec![2u8; 5]);
    }

    #[test]
    fn disc_req_fails_pending_receive() {
        let mut pipe = make_pipe(1500, 1 << 20);
        let (op, handle) = crate::op::pair::<Vec<u8>>();
        pipe.recv(Instant::now(), handle);
        pipe.on_disc_req();
        assert!(matches!(op.wait(), Err(TransportError::Closed)));
    }
}
