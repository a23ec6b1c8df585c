//! Rewind buffer
//!
//! Bounded ring of machine snapshots taken at frame boundaries. The newest
//! entry is always a full state; with deltas on, older entries are kept as
//! reverse XOR deltas against their newer neighbour, stored as sparse runs
//! of changed bytes. Dropping the oldest entry never breaks reconstruction
//! because nothing depends on it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::RewindConfig;
use crate::machine::MachineResult;

/// A restorable point in history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindPoint {
    /// Completed-frame count the state belongs to
    pub frame: u64,
    pub state: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewindStats {
    pub len: usize,
    pub capacity: usize,
    /// Snapshots pushed since creation or the last clear
    pub captured: u64,
    /// Snapshots dropped for lack of room
    pub evicted: u64,
    /// Bytes held by stored entries
    pub memory_bytes: usize,
    pub oldest_frame: Option<u64>,
    pub newest_frame: Option<u64>,
}

#[derive(Debug, Clone)]
enum Payload {
    Full(Bytes),
    /// XOR runs against the next newer entry
    Delta(Bytes),
}

impl Payload {
    fn size(&self) -> usize {
        match self {
            Payload::Full(bytes) | Payload::Delta(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    frame: u64,
    payload: Payload,
}

pub struct RewindBuffer {
    entries: VecDeque<Entry>,
    enabled: bool,
    capacity: usize,
    interval: u64,
    deltas: bool,
    captured: u64,
    evicted: u64,
    budget: Option<Duration>,
    over_budget: bool,
}

impl RewindBuffer {
    pub fn new(config: &RewindConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.capacity.min(1024)),
            enabled: config.enabled && config.capacity > 0,
            capacity: config.capacity.max(1),
            interval: config.interval.max(1),
            deltas: config.deltas,
            captured: 0,
            evicted: 0,
            budget: None,
            over_budget: false,
        }
    }

    /// Warn when a capture takes longer than `budget`
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Whether the boundary ending `frame` is a snapshot point
    pub fn should_capture(&self, frame: u64) -> bool {
        self.enabled && frame % self.interval == 0
    }

    /// Time `snapshot` and store its result for `frame`.
    ///
    /// Returns false (and takes no snapshot) when `frame` is not a snapshot
    /// point.
    pub fn capture<F>(&mut self, frame: u64, snapshot: F) -> MachineResult<bool>
    where
        F: FnOnce() -> MachineResult<Bytes>,
    {
        if !self.should_capture(frame) {
            return Ok(false);
        }
        let started = Instant::now();
        let state = snapshot()?;
        self.push(frame, state);

        if let Some(budget) = self.budget {
            let elapsed = started.elapsed();
            if elapsed > budget {
                if !self.over_budget {
                    tracing::warn!(
                        "Rewind capture at frame {} took {:?} (budget {:?}); consider a larger interval",
                        frame,
                        elapsed,
                        budget
                    );
                }
                self.over_budget = true;
            } else {
                self.over_budget = false;
            }
        }
        Ok(true)
    }

    /// Store the state at the end of `frame`.
    ///
    /// Entries at or after `frame` are history that was rewound over and are
    /// dropped first, so frames stay strictly increasing.
    pub fn push(&mut self, frame: u64, state: Bytes) {
        while self.entries.back().is_some_and(|entry| entry.frame >= frame) {
            self.pop_newest();
        }

        if self.deltas {
            if let Some(newest) = self.entries.back_mut() {
                if let Payload::Full(previous) = &newest.payload {
                    if previous.len() == state.len() {
                        newest.payload = Payload::Delta(encode_delta(previous, &state));
                    }
                }
            }
        }

        self.entries.push_back(Entry {
            frame,
            payload: Payload::Full(state),
        });
        self.captured += 1;

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    /// Step back from `current_frame`.
    ///
    /// Returns the newest snapshot strictly older than `current_frame`, or
    /// `None` when history is exhausted. The oldest entry is never dropped,
    /// so repeated calls at the start of history keep returning `None`
    /// without disturbing anything.
    pub fn rewind(&mut self, current_frame: u64) -> Option<RewindPoint> {
        while self.entries.len() > 1
            && self
                .entries
                .back()
                .is_some_and(|entry| entry.frame >= current_frame)
        {
            self.pop_newest();
        }

        let newest = self.entries.back()?;
        if newest.frame >= current_frame {
            return None;
        }
        match &newest.payload {
            Payload::Full(state) => Some(RewindPoint {
                frame: newest.frame,
                state: state.clone(),
            }),
            Payload::Delta(_) => None,
        }
    }

    /// Newest retained snapshot
    pub fn newest(&self) -> Option<RewindPoint> {
        let entry = self.entries.back()?;
        match &entry.payload {
            Payload::Full(state) => Some(RewindPoint {
                frame: entry.frame,
                state: state.clone(),
            }),
            Payload::Delta(_) => None,
        }
    }

    pub fn oldest_frame(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.frame)
    }

    pub fn newest_frame(&self) -> Option<u64> {
        self.entries.back().map(|entry| entry.frame)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.captured = 0;
        self.evicted = 0;
        self.over_budget = false;
    }

    pub fn stats(&self) -> RewindStats {
        RewindStats {
            len: self.entries.len(),
            capacity: self.capacity,
            captured: self.captured,
            evicted: self.evicted,
            memory_bytes: self.entries.iter().map(|entry| entry.payload.size()).sum(),
            oldest_frame: self.oldest_frame(),
            newest_frame: self.newest_frame(),
        }
    }

    /// Remove the newest entry and turn its neighbour back into a full state
    fn pop_newest(&mut self) {
        let Some(popped) = self.entries.pop_back() else {
            return;
        };
        let Payload::Full(newer) = popped.payload else {
            return;
        };
        if let Some(entry) = self.entries.back_mut() {
            if let Payload::Delta(delta) = &entry.payload {
                entry.payload = Payload::Full(apply_delta(&newer, delta));
            }
        }
    }
}

/// Sparse XOR runs: `[offset u32][len u32][bytes]...`
fn encode_delta(older: &[u8], newer: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    let mut index = 0;
    while index < older.len() {
        if older[index] == newer[index] {
            index += 1;
            continue;
        }
        let start = index;
        while index < older.len() && older[index] != newer[index] {
            index += 1;
        }
        out.put_u32_le(start as u32);
        out.put_u32_le((index - start) as u32);
        for offset in start..index {
            out.put_u8(older[offset] ^ newer[offset]);
        }
    }
    out.freeze()
}

fn apply_delta(newer: &[u8], delta: &[u8]) -> Bytes {
    let mut state = newer.to_vec();
    let mut runs = delta;
    while runs.remaining() >= 8 {
        let start = runs.get_u32_le() as usize;
        let len = runs.get_u32_le() as usize;
        let len = len.min(runs.remaining());
        for (offset, byte) in runs[..len].iter().enumerate() {
            if let Some(slot) = state.get_mut(start + offset) {
                *slot ^= byte;
            }
        }
        runs.advance(len);
    }
    Bytes::from(state)
}
