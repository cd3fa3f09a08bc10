use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::{debug, info};
use thiserror::Error;

use crate::frame::CANFrame;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("No free frame available and the pool is at capacity.")]
    Exhausted,
}

/// Stable index of a frame slot inside a `FrameBuffer` arena. Lists inside
/// the pool pass handles around instead of references, so a slot can move
/// between the free, pending and in-flight lists without aliasing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FrameHandle(usize);

/// Upper bound of the serialized size of a frame, valid for both wire
/// formats: the native format needs at most 6 bytes besides the payload,
/// the generic one pads short frames to 13 bytes.
fn frame_bound(frame: &CANFrame) -> usize {
    (6 + frame.len()).max(13)
}

struct PoolState {
    arena: Vec<CANFrame>,
    free: Vec<FrameHandle>,
    pending: VecDeque<FrameHandle>,
    pending_bytes: usize,
    in_flight: Vec<FrameHandle>,
    in_flight_locked: bool,
}

/// FrameBuffer
///
/// A pool of frame slots with a double transmit buffer. Producers obtain a
/// slot with `request` and queue it with `insert`; the dispatcher moves the
/// whole pending list into the in-flight list with `swap`, encodes from it,
/// hands the unencoded tail back with `return_intermediate` and frees the
/// rest with `merge_intermediate`. Only a single dispatcher may drive the
/// swap/return/merge cycle; producers may fill the pending list at any time.
pub struct FrameBuffer {
    state: Mutex<PoolState>,
    available: Condvar,
    max_frames: Option<usize>,
}

impl FrameBuffer {
    /// Create a pool with `initial_frames` pre-allocated slots. With
    /// `max_frames` of `None` the arena grows on demand, otherwise
    /// `request` blocks (or fails) once all `max_frames` slots are taken.
    pub fn new(initial_frames: usize, max_frames: Option<usize>) -> FrameBuffer {
        let arena = vec![CANFrame::default(); initial_frames];
        let free = (0..initial_frames).map(FrameHandle).collect();

        FrameBuffer {
            state: Mutex::new(PoolState {
                arena,
                free,
                pending: VecDeque::new(),
                pending_bytes: 0,
                in_flight: Vec::new(),
                in_flight_locked: false,
            }),
            available: Condvar::new(),
            max_frames,
        }
    }

    /// Obtain a free slot. Grows the arena when the pool is unbounded or
    /// below its limit; at the limit the call blocks until a slot is
    /// released, or fails immediately when `blocking` is false. With
    /// `debug` set, growth is logged.
    pub fn request(&self, blocking: bool, debug: bool) -> Result<FrameHandle, BufferError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(handle) = state.free.pop() {
                return Ok(handle);
            }
            let at_capacity = self
                .max_frames
                .map_or(false, |max| state.arena.len() >= max);
            if !at_capacity {
                let handle = FrameHandle(state.arena.len());
                state.arena.push(CANFrame::default());
                if debug {
                    debug!("Frame pool grown to {} slots.", state.arena.len());
                }
                return Ok(handle);
            }
            if !blocking {
                return Err(BufferError::Exhausted);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Write a slot without queueing it anywhere. Used by the receive path,
    /// which delivers frames straight out of the arena.
    pub fn fill(&self, handle: FrameHandle, frame: CANFrame) {
        let mut state = self.state.lock().unwrap();
        state.arena[handle.0] = frame;
    }

    /// Copy a slot out of the arena.
    pub fn get(&self, handle: FrameHandle) -> CANFrame {
        let state = self.state.lock().unwrap();
        state.arena[handle.0]
    }

    /// Queue a requested slot at the tail of the pending list.
    pub fn insert(&self, handle: FrameHandle, frame: CANFrame) {
        let mut state = self.state.lock().unwrap();
        state.arena[handle.0] = frame;
        state.pending_bytes += frame_bound(&frame);
        state.pending.push_back(handle);
    }

    /// Hand a slot back to the free list without transmitting it.
    pub fn release(&self, handle: FrameHandle) {
        let mut state = self.state.lock().unwrap();
        state.free.push(handle);
        self.available.notify_one();
    }

    /// Serialized size bound of the pending list in bytes.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().unwrap().pending_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Move the entire pending list into the in-flight list and take the
    /// in-flight lock. Dispatcher only; the previous cycle must have been
    /// completed with `merge_intermediate`.
    pub fn swap(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.in_flight_locked);
        debug_assert!(state.in_flight.is_empty());
        state.in_flight_locked = true;
        state.pending_bytes = 0;
        let PoolState {
            pending, in_flight, ..
        } = &mut *state;
        in_flight.extend(pending.drain(..));
    }

    /// Stable sort of the in-flight list by the raw 32 bit id, ascending.
    pub fn sort_intermediate(&self) {
        let mut state = self.state.lock().unwrap();
        let PoolState {
            arena, in_flight, ..
        } = &mut *state;
        in_flight.sort_by_key(|handle| arena[handle.0].raw_id());
    }

    /// Snapshot of the in-flight frames, in list order.
    pub fn in_flight(&self) -> Vec<CANFrame> {
        let state = self.state.lock().unwrap();
        state
            .in_flight
            .iter()
            .map(|handle| state.arena[handle.0])
            .collect()
    }

    /// Move the in-flight frames from index `from` onwards back to the head
    /// of the pending list, keeping their order. The spillover of an
    /// overflowing packet therefore leaves before anything queued later.
    pub fn return_intermediate(&self, from: usize) {
        let mut state = self.state.lock().unwrap();
        let PoolState {
            arena,
            pending,
            pending_bytes,
            in_flight,
            ..
        } = &mut *state;
        for handle in in_flight.drain(from..).rev() {
            *pending_bytes += frame_bound(&arena[handle.0]);
            pending.push_front(handle);
        }
    }

    /// Drop the in-flight lock taken by `swap`.
    pub fn unlock_intermediate(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight_locked = false;
    }

    /// Release the remaining (encoded) in-flight slots back to the free
    /// list.
    pub fn merge_intermediate(&self) {
        let mut state = self.state.lock().unwrap();
        let PoolState {
            free, in_flight, ..
        } = &mut *state;
        free.extend(in_flight.drain(..));
        self.available.notify_all();
    }

    /// (free, pending, in-flight) slot counts.
    pub fn stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.free.len(),
            state.pending.len(),
            state.in_flight.len(),
        )
    }

    pub fn debug(&self) {
        let (free, pending, in_flight) = self.stats();
        info!(
            "Frame pool: {} free, {} pending, {} in flight.",
            free, pending, in_flight
        );
    }
}
