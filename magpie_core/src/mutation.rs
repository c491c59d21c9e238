//! Byte-level sample mutation. Operations are chosen from a weighted
//! table; a per-sample context tracks the mutation budget of the
//! current round.

use crate::sample::Sample;
use crate::RngType;
use rand::prelude::*;
use std::sync::Arc;

const DEFAULT_ROUND_LEN: u64 = 512;
/// Extra round budget granted when an attempt found new coverage.
const NEW_COVERAGE_BONUS: u64 = 64;
const MAX_OP_TRIES: usize = 16;
const MAX_BLOCK: usize = 1 << 12;

/// Per-sample mutator state. Created lazily the first time a corpus
/// entry is fuzzed and kept alive with the entry.
#[derive(Debug, Default)]
pub struct SampleContext {
    remaining: u64,
    rounds: u64,
}

impl SampleContext {
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

pub struct ByteMutator {
    round_len: u64,
}

impl Default for ByteMutator {
    fn default() -> Self {
        Self {
            round_len: DEFAULT_ROUND_LEN,
        }
    }
}

type MutateOperation = fn(&mut Vec<u8>, &mut RngType, &[Arc<Sample>]) -> bool;
const OPERATIONS: [MutateOperation; 7] = [
    bit_flip,
    byte_replace,
    arith,
    interesting_value,
    block_erase,
    block_duplicate,
    splice,
];
// cumulative weights over OPERATIONS
const WEIGHTS: [u64; 7] = [25, 45, 60, 72, 82, 90, 100];

impl ByteMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_round_len(round_len: u64) -> Self {
        Self { round_len }
    }

    pub fn create_context(&self, _sample: &Sample) -> SampleContext {
        SampleContext::default()
    }

    pub fn init_round(&self, _sample: &Sample, ctx: &mut SampleContext) {
        ctx.remaining = self.round_len;
        ctx.rounds += 1;
    }

    /// Mutate `sample` in place. Returns false when the round budget is
    /// exhausted; the caller clamps the result to the maximum sample
    /// size afterwards.
    pub fn mutate(
        &self,
        sample: &mut Sample,
        ctx: &mut SampleContext,
        rng: &mut RngType,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        if ctx.remaining == 0 {
            return false;
        }
        ctx.remaining -= 1;

        let buf = sample.bytes_mut();
        for _ in 0..MAX_OP_TRIES {
            let idx = choose_weighted(rng, &WEIGHTS);
            if OPERATIONS[idx](buf, rng, all_samples) {
                break;
            }
        }
        true
    }

    pub fn notify_result(&self, ctx: &mut SampleContext, had_new_coverage: bool) {
        if had_new_coverage {
            ctx.remaining += NEW_COVERAGE_BONUS;
        }
    }
}

/// Pick an index from a cumulative weight table.
pub fn choose_weighted(rng: &mut RngType, cum_weights: &[u64]) -> usize {
    let total = *cum_weights.last().unwrap();
    let n = rng.gen_range(0..total);
    cum_weights.partition_point(|&w| w <= n)
}

fn bit_flip(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let idx = rng.gen_range(0..buf.len());
    buf[idx] ^= 1 << rng.gen_range(0..8);
    true
}

fn byte_replace(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let idx = rng.gen_range(0..buf.len());
    buf[idx] = rng.gen();
    true
}

fn arith(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    const WIDTHS: [usize; 4] = [1, 2, 4, 8];
    let width = WIDTHS[rng.gen_range(0..WIDTHS.len())];
    if buf.len() < width {
        return false;
    }
    let start = rng.gen_range(0..=buf.len() - width);
    let mut delta = rng.gen_range(-35i64..=35);
    if delta == 0 {
        delta = 1;
    }
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&buf[start..start + width]);
    let v = u64::from_le_bytes(raw).wrapping_add(delta as u64);
    buf[start..start + width].copy_from_slice(&v.to_le_bytes()[..width]);
    true
}

fn interesting_value(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    const VALUES: [i64; 12] = [
        0,
        1,
        -1,
        16,
        64,
        127,
        -128,
        255,
        256,
        4096,
        i32::MAX as i64,
        i64::MIN,
    ];
    const WIDTHS: [usize; 4] = [1, 2, 4, 8];
    let width = WIDTHS[rng.gen_range(0..WIDTHS.len())];
    if buf.len() < width {
        return false;
    }
    let start = rng.gen_range(0..=buf.len() - width);
    let v = VALUES[rng.gen_range(0..VALUES.len())] as u64;
    buf[start..start + width].copy_from_slice(&v.to_le_bytes()[..width]);
    true
}

fn block_erase(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let len = rng.gen_range(1..=buf.len().min(MAX_BLOCK));
    let start = rng.gen_range(0..=buf.len() - len);
    buf.drain(start..start + len);
    true
}

fn block_duplicate(buf: &mut Vec<u8>, rng: &mut RngType, _all: &[Arc<Sample>]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let len = rng.gen_range(1..=buf.len().min(MAX_BLOCK));
    let start = rng.gen_range(0..=buf.len() - len);
    let block: Vec<u8> = buf[start..start + len].to_vec();
    let at = rng.gen_range(0..=buf.len());
    buf.splice(at..at, block);
    true
}

/// Copy a block from another retained sample, either overwriting bytes
/// in place or inserting them.
fn splice(buf: &mut Vec<u8>, rng: &mut RngType, all: &[Arc<Sample>]) -> bool {
    if all.is_empty() {
        return false;
    }
    let donor = &all[rng.gen_range(0..all.len())];
    if donor.is_empty() {
        return false;
    }
    let len = rng.gen_range(1..=donor.size().min(MAX_BLOCK));
    let start = rng.gen_range(0..=donor.size() - len);
    let block = &donor.bytes()[start..start + len];

    if !buf.is_empty() && rng.gen_bool(0.5) {
        let at = rng.gen_range(0..buf.len());
        let n = len.min(buf.len() - at);
        buf[at..at + n].copy_from_slice(&block[..n]);
    } else {
        let at = rng.gen_range(0..=buf.len());
        buf.splice(at..at, block.iter().copied());
    }
    true
}
