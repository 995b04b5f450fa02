//! Index correspondence between two independently generated point sets.
//!
//! The high-fidelity run samples fields at a set of query points,
//! while the modal basis is stored on the full low-fidelity mesh.
//! The two sets describe the same physical locations
//! but come from different tools, so their coordinates differ by small offsets
//! and their orderings are unrelated.
//! [`resolve`] rounds both to a common precision and matches them up.

use std::collections::HashMap;

use fixedbitset as fb;
use tracing::warn;

use crate::PointSet;

/// A query point that has no counterpart in the target mesh.
///
/// This is not fatal on its own; it's reported so that the caller
/// (or an operator reading the logs) can decide whether the gap is acceptable.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CorrespondenceError {
    /// No target point matched the rounded coordinates of a query point.
    #[error("query point {index} at {coords:?} not found in the target mesh")]
    Unmatched {
        /// Index of the point in the query set.
        index: usize,
        /// Coordinates of the query point, unrounded.
        coords: Vec<f64>,
    },
}

/// Mapping from query point index to target point index.
///
/// Its length always equals the size of the query set;
/// entries for unmatched points are `None` and are also listed in
/// [`gaps`][Self::gaps].
#[derive(Clone, Debug, PartialEq)]
pub struct CorrespondenceMap {
    entries: Vec<Option<usize>>,
    target_len: usize,
    gaps: Vec<CorrespondenceError>,
}

impl CorrespondenceMap {
    /// Create a map directly from its entries.
    ///
    /// Unmatched entries are recorded as gaps without coordinates.
    pub fn from_entries(entries: Vec<Option<usize>>, target_len: usize) -> Self {
        let gaps = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(index, _)| CorrespondenceError::Unmatched {
                index,
                coords: Vec::new(),
            })
            .collect();
        Self {
            entries,
            target_len,
            gaps,
        }
    }

    /// Number of query points in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of points in the target set the map points into.
    #[inline]
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// Get the target index of a query point, if it was matched.
    #[inline]
    pub fn get(&self, query_idx: usize) -> Option<usize> {
        self.entries.get(query_idx).copied().flatten()
    }

    /// The raw entries, one per query point.
    #[inline]
    pub fn entries(&self) -> &[Option<usize>] {
        &self.entries
    }

    /// Diagnostics for every query point without a match.
    #[inline]
    pub fn gaps(&self) -> &[CorrespondenceError] {
        &self.gaps
    }

    /// Check whether every query point was matched.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Bitset of the query points that were matched.
    pub fn matched(&self) -> fb::FixedBitSet {
        let mut bits = fb::FixedBitSet::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.is_some() {
                bits.insert(idx);
            }
        }
        bits
    }

    /// Expand the map for a field stored as stacked per-component blocks.
    ///
    /// See [`FlatIndexMap`] for the layout.
    pub fn flattened(&self, components: usize) -> FlatIndexMap {
        let indices = (0..components)
            .flat_map(|comp| {
                self.entries
                    .iter()
                    .map(move |entry| entry.map(|idx| idx + comp * self.target_len))
            })
            .collect();
        FlatIndexMap {
            indices,
            components,
            source_len: self.target_len * components,
        }
    }
}

/// A [`CorrespondenceMap`] expanded to every scalar of a multi-component field.
///
/// Fields are stored component-major: all x-components of the mesh first,
/// then all y-components and so on.
/// Query index `i` with target index `t` thus expands to
/// `[t, t + m, t + 2m, ...]` with `m` the target mesh size,
/// and these land at positions `i, i + q, i + 2q, ...` of the flattened map
/// with `q` the query set size.
/// This must match the layout of the modal basis on disk exactly,
/// otherwise reconstructed components come out permuted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatIndexMap {
    indices: Vec<Option<usize>>,
    components: usize,
    source_len: usize,
}

impl FlatIndexMap {
    /// Flat indices into the full field, one per flat query entry.
    #[inline]
    pub fn indices(&self) -> &[Option<usize>] {
        &self.indices
    }

    /// Number of components per point.
    #[inline]
    pub fn components(&self) -> usize {
        self.components
    }

    /// Length of the full (unrestricted) field vector this map indexes into.
    #[inline]
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Length of the restricted field vector.
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Check whether the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Expand a single scalar mesh index into one index per component
/// of a component-major field on a mesh of `mesh_size` points.
pub fn expand_index(
    index: usize,
    components: usize,
    mesh_size: usize,
) -> impl Iterator<Item = usize> {
    (0..components).map(move |comp| index + comp * mesh_size)
}

/// Find the target point corresponding to each query point.
///
/// Both sets are rounded to `precision` decimal places
/// (ties to even) before comparing,
/// which absorbs the small generation offsets between independently produced sets.
/// When several target points share the same rounded coordinates,
/// the first one in target order wins, so the result is deterministic.
///
/// Query points without a match are logged as warnings
/// and recorded in [`CorrespondenceMap::gaps`].
pub fn resolve<const DIM: usize>(
    query: &PointSet<DIM>,
    target: &PointSet<DIM>,
    precision: u32,
) -> CorrespondenceMap {
    let scale = 10f64.powi(precision as i32);

    let mut lookup: HashMap<[i64; DIM], usize> = HashMap::with_capacity(target.len());
    for (idx, point) in target.iter().enumerate() {
        lookup.entry(rounded_key(point, scale)).or_insert(idx);
    }

    let mut entries = Vec::with_capacity(query.len());
    let mut gaps = Vec::new();
    for (idx, point) in query.iter().enumerate() {
        let found = lookup.get(&rounded_key(point, scale)).copied();
        if found.is_none() {
            warn!(
                "Query point {} at {:?} not found in the target mesh",
                idx,
                point.as_slice()
            );
            gaps.push(CorrespondenceError::Unmatched {
                index: idx,
                coords: point.as_slice().to_vec(),
            });
        }
        entries.push(found);
    }

    CorrespondenceMap {
        entries,
        target_len: target.len(),
        gaps,
    }
}

/// Round a point to integer multiples of `1 / scale`.
///
/// Comparing these integers is equivalent to comparing the rounded floats
/// but also treats `-0.0` and `0.0` as the same value.
fn rounded_key<const DIM: usize>(point: &nalgebra::SVector<f64, DIM>, scale: f64) -> [i64; DIM] {
    std::array::from_fn(|i| (point[i] * scale).round_ties_even() as i64)
}
