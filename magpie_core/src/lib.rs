//! Core algorithms and data structures of the magpie fuzzer

use ahash::{AHashMap, AHashSet};

pub mod codec;
pub mod corpus;
pub mod coverage;
pub mod mutation;
pub mod sample;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;

/// Upper bound on the size of any sample, seed or mutant.
pub const MAX_SAMPLE_SIZE: usize = 1 << 20;
