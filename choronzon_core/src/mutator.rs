use crate::gene::{GenePath, GeneTree};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Hard ceiling on bytes inserted by a single `byte_insert` application.
const MAX_INSERT: usize = 4096;

/// Boundary constants written by `boundary_value`, before masking to the
/// window width. Width-dependent signed extrema are added per application.
const BOUNDARIES: [u64; 9] = [
    0,
    1,
    u64::MAX, // -1
    0x7F,
    0x80,
    0xFF,
    0xFFFF,
    0x7FFF_FFFF,
    0x8000_0000,
];

/// A byte-level variation operator.
///
/// Mutators act on the payload of one randomly chosen structural gene of a
/// single parent tree and never touch the tree's shape. Every application
/// returns a new tree; the parent is left intact. An operator that finds no
/// eligible payload returns `None`, which the scheduler records as a no-op.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Mutator {
    /// Flip random bits in one payload.
    BitFlip,
    /// XOR random bytes with random nonzero masks.
    ByteFlip,
    /// Set the high bit of one byte.
    ByteSetHighBit,
    /// Clear the high bit of one byte.
    ByteClearHighBit,
    /// Overwrite one byte with a uniformly random value.
    RandomByte,
    /// Swap two random byte positions within one payload.
    ByteSwap,
    /// Insert random bytes at a random position.
    ByteInsert,
    /// Remove consecutive bytes at a random position.
    ByteDelete,
    /// Overwrite an aligned 1/2/4/8-byte window with a boundary value.
    BoundaryValue,
}

impl Mutator {
    pub const ALL: [Mutator; 9] = [
        Mutator::BitFlip,
        Mutator::ByteFlip,
        Mutator::ByteSetHighBit,
        Mutator::ByteClearHighBit,
        Mutator::RandomByte,
        Mutator::ByteSwap,
        Mutator::ByteInsert,
        Mutator::ByteDelete,
        Mutator::BoundaryValue,
    ];

    /// Stable name used in weight tables and lineage records.
    pub fn name(self) -> &'static str {
        match self {
            Mutator::BitFlip => "bit_flip",
            Mutator::ByteFlip => "byte_flip",
            Mutator::ByteSetHighBit => "byte_set_high_bit",
            Mutator::ByteClearHighBit => "byte_clear_high_bit",
            Mutator::RandomByte => "random_byte",
            Mutator::ByteSwap => "byte_swap",
            Mutator::ByteInsert => "byte_insert",
            Mutator::ByteDelete => "byte_delete",
            Mutator::BoundaryValue => "boundary_value",
        }
    }

    /// Applies the mutator to one randomly chosen eligible payload of
    /// `tree`. `budget` is the fraction of the selected payload's size the
    /// operator may touch, clamped to at least one unit.
    ///
    /// Returns `None` when the tree holds no eligible payload (no-op).
    pub fn apply<R: Rng + ?Sized>(
        self,
        rng: &mut R,
        tree: &GeneTree,
        budget: f64,
    ) -> Option<GeneTree> {
        let allow_empty = matches!(self, Mutator::ByteInsert);
        let targets = eligible_payloads(tree, allow_empty);
        if targets.is_empty() {
            return None;
        }
        let path = &targets[rng.random_range(0..targets.len())];
        let payload = tree.gene_at(path)?.payload.clone();
        let is_leaf = tree.gene_at(path)?.flags.leaf;

        let mutated = match self {
            Mutator::BitFlip => bit_flip(rng, payload, budget),
            Mutator::ByteFlip => byte_flip(rng, payload, budget),
            Mutator::ByteSetHighBit => high_bit(rng, payload, true),
            Mutator::ByteClearHighBit => high_bit(rng, payload, false),
            Mutator::RandomByte => random_byte(rng, payload),
            Mutator::ByteSwap => byte_swap(rng, payload)?,
            Mutator::ByteInsert => byte_insert(rng, payload, budget),
            Mutator::ByteDelete => byte_delete(rng, payload, budget, is_leaf)?,
            Mutator::BoundaryValue => boundary_value(rng, payload)?,
        };

        tree.with_payload_at(path, mutated).ok()
    }
}

/// Paths of all structural genes whose payload the mutators may edit.
///
/// Non-structural genes (a format signature, say) are off limits, matching
/// the recombinators' notion of what is fair game.
fn eligible_payloads(tree: &GeneTree, allow_empty: bool) -> Vec<GenePath> {
    tree.walk()
        .filter(|(_, g)| g.flags.structural && (allow_empty || !g.payload.is_empty()))
        .map(|(p, _)| p)
        .collect()
}

/// Budgeted unit count: `frac` of `total`, at least one, at most `total`.
fn budgeted(total: usize, frac: f64) -> usize {
    ((total as f64 * frac).ceil() as usize).clamp(1, total)
}

fn bit_flip<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>, budget: f64) -> Vec<u8> {
    let bits = data.len() * 8;
    let n = budgeted(bits, budget);
    for idx in index::sample(rng, bits, n) {
        data[idx / 8] ^= 1 << (idx % 8);
    }
    data
}

fn byte_flip<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>, budget: f64) -> Vec<u8> {
    let n = budgeted(data.len(), budget);
    for idx in index::sample(rng, data.len(), n) {
        data[idx] ^= rng.random_range(1u8..=0xFF);
    }
    data
}

fn high_bit<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>, set: bool) -> Vec<u8> {
    let idx = rng.random_range(0..data.len());
    if set {
        data[idx] |= 0x80;
    } else {
        data[idx] &= 0x7F;
    }
    data
}

fn random_byte<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>) -> Vec<u8> {
    let idx = rng.random_range(0..data.len());
    data[idx] = rng.random();
    data
}

fn byte_swap<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>) -> Option<Vec<u8>> {
    if data.len() < 2 {
        return None;
    }
    let picked = index::sample(rng, data.len(), 2);
    data.swap(picked.index(0), picked.index(1));
    Some(data)
}

fn byte_insert<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>, budget: f64) -> Vec<u8> {
    let k = budgeted(data.len().max(1), budget).min(MAX_INSERT);
    let at = rng.random_range(0..=data.len());
    let fresh: Vec<u8> = (0..k).map(|_| rng.random()).collect();
    data.splice(at..at, fresh);
    data
}

fn byte_delete<R: Rng + ?Sized>(
    rng: &mut R,
    mut data: Vec<u8>,
    budget: f64,
    keep_nonempty: bool,
) -> Option<Vec<u8>> {
    let floor = if keep_nonempty { 1 } else { 0 };
    if data.len() <= floor {
        return None;
    }
    let k = budgeted(data.len(), budget).min(data.len() - floor);
    let at = rng.random_range(0..=data.len() - k);
    data.drain(at..at + k);
    Some(data)
}

fn boundary_value<R: Rng + ?Sized>(rng: &mut R, mut data: Vec<u8>) -> Option<Vec<u8>> {
    let widths: Vec<usize> = [1usize, 2, 4, 8]
        .into_iter()
        .filter(|&w| w <= data.len())
        .collect();
    if widths.is_empty() {
        return None;
    }
    let width = widths[rng.random_range(0..widths.len())];
    let slots = data.len() / width;
    let at = rng.random_range(0..slots) * width;

    let smax = (1u64 << (width * 8 - 1)) - 1;
    let smin = 1u64 << (width * 8 - 1);
    let pick = rng.random_range(0..BOUNDARIES.len() + 2);
    let value = match pick {
        n if n < BOUNDARIES.len() => BOUNDARIES[n],
        n if n == BOUNDARIES.len() => smax,
        _ => smin,
    };
    let bytes = value.to_le_bytes();
    data[at..at + width].copy_from_slice(&bytes[..width]);
    Some(data)
}
