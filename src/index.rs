//! Exact nearest-neighbour search over unit vectors.
//!
//! Every implementation returns the same neighbours for the same data:
//! ascending squared L2 distance, ties broken by ascending row id.

use std::{cmp::Ordering, collections::BinaryHeap};

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Rows scanned per rayon task.
const SCAN_CHUNK_ROWS: usize = 4096;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row_id: u64,
    /// Squared L2 distance to the query.
    pub distance: f32,
}

impl Neighbor {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.row_id.cmp(&other.row_id))
    }
}

// The heap keeps the worst retained neighbour on top.
impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

/// Read access to a set of vectors addressed by row id.
pub trait NeighborSearch: Send + Sync {
    fn dimension(&self) -> usize;

    /// Number of stored vectors.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` nearest rows to `query`, best first.
    ///
    /// Fails with [`Error::DimensionMismatch`] when `query` has the wrong
    /// length.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;
}

/// Squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

pub(crate) fn check_dimension(expected: usize, query: &[f32]) -> Result<()> {
    if query.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: query.len(),
        });
    }
    Ok(())
}

/// Bounded collector of the `k` best neighbours.
#[derive(Debug)]
pub(crate) struct TopK {
    k: usize,
    heap: BinaryHeap<Neighbor>,
}

impl TopK {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(1024)),
        }
    }

    pub(crate) fn push(&mut self, candidate: Neighbor) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek()
            && candidate < *worst
        {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub(crate) fn merge(mut self, other: TopK) -> TopK {
        for n in other.heap {
            self.push(n);
        }
        self
    }

    /// Neighbours, best first.
    pub(crate) fn into_sorted(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// Vectors held contiguously in memory and scanned in parallel.
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Wrap a row-major buffer of `data.len() / dimension` vectors.
    pub fn new(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: data.len(),
            });
        }
        Ok(Self { dimension, data })
    }

    pub fn vector(&self, row_id: u64) -> Option<&[f32]> {
        let start = (row_id as usize).checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }
}

impl NeighborSearch for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> u64 {
        (self.data.len() / self.dimension) as u64
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        check_dimension(self.dimension, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let dim = self.dimension;
        let rows_per_chunk = SCAN_CHUNK_ROWS;
        let top = self
            .data
            .par_chunks(rows_per_chunk * dim)
            .enumerate()
            .map(|(chunk_idx, chunk)| {
                let base = (chunk_idx * rows_per_chunk) as u64;
                let mut top = TopK::new(k);
                for (i, row) in chunk.chunks_exact(dim).enumerate() {
                    top.push(Neighbor {
                        row_id: base + i as u64,
                        distance: squared_l2(query, row),
                    });
                }
                top
            })
            .reduce(|| TopK::new(k), TopK::merge);

        Ok(top.into_sorted())
    }
}

impl std::fmt::Debug for FlatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
