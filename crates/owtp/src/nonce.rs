//! Snowflake-style nonce generator.
//!
//! Layout (most significant first): 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of worker id, 12 bits of sequence. Nonces from one
//! generator are strictly increasing, also when the wall clock steps back.

use rand::Rng;
use std::sync::Mutex;

/// 2018-01-01T00:00:00Z.
pub const EPOCH_MS: u64 = 1_514_764_800_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Distributed, monotonically increasing nonce source.
#[derive(Debug)]
pub struct NonceGenerator {
    worker_id: u16,
    state: Mutex<State>,
}

impl NonceGenerator {
    /// Generator with a random worker id.
    pub fn new() -> Self {
        Self::with_worker(rand::thread_rng().gen_range(0..=MAX_WORKER))
    }

    pub fn with_worker(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Next nonce. Never returns 0.
    pub fn next(&self) -> u64 {
        let now = (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(EPOCH_MS);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // A clock that steps back keeps using the last observed millisecond
        let mut ms = now.max(state.last_ms);
        if ms == state.last_ms {
            state.sequence += 1;
            if state.sequence > MAX_SEQUENCE {
                // Sequence exhausted: borrow the next millisecond
                ms += 1;
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = ms;

        (ms << (WORKER_BITS + SEQUENCE_BITS))
            | ((self.worker_id as u64) << SEQUENCE_BITS)
            | state.sequence
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
