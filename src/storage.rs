//! The strategies a [`Factor`][crate::Factor] can use to hold its cells.
//!
//! Every strategy stores log-values and keeps an exact count of the cells that are not
//! [`LOG_ZERO`]. Factors only talk to their storage through the [`Storage`] trait, and have
//! already bounds-checked every index they pass in.

use crate::density::{Density, Jdf};
use crate::error::{FactorError, Result};
use crate::factor::Trace;
use crate::LOG_ZERO;
use std::collections::HashMap;
use std::fmt;
use std::mem::replace;
use std::sync::Arc;

/// Chooses how a new factor's cells are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StorageKind {
    /// One contiguous array with a slot for every cell. Constant-time access, but memory
    /// proportional to the full table size.
    Dense,
    /// A hash table holding only the cells that are not zero. Memory proportional to occupancy.
    Sparse,
}

impl StorageKind {
    /// Picks a strategy for a table of `size` cells, of which about `expected_occupied` are
    /// expected to be non-zero.
    ///
    /// Tables no bigger than `threshold` are always dense. Larger tables are sparse only if they
    /// are expected to be less than a quarter full.
    ///
    /// ```
    /// use factor_tables::StorageKind;
    ///
    /// assert_eq!(StorageKind::choose(1 << 20, 1 << 20, 4096), StorageKind::Dense);
    /// assert_eq!(StorageKind::choose(1 << 20, 1000, 4096), StorageKind::Sparse);
    /// assert_eq!(StorageKind::choose(100, 1, 4096), StorageKind::Dense);
    /// ```
    pub fn choose(size: usize, expected_occupied: usize, threshold: usize) -> StorageKind {
        if size > threshold && expected_occupied.saturating_mul(4) < size {
            StorageKind::Sparse
        } else {
            StorageKind::Dense
        }
    }

    pub(crate) fn create<D: Density>(self, size: usize) -> Box<dyn Storage<D>> {
        match self {
            StorageKind::Dense => Box::new(DenseStorage::new(size)),
            StorageKind::Sparse => Box::new(SparseStorage::new(size)),
        }
    }
}

/// The interface shared by every storage strategy.
///
/// Writing [`LOG_ZERO`] or `NaN` clears a cell; both are stored as [`LOG_ZERO`].
pub trait Storage<D: Density>: fmt::Debug + Send + Sync {
    /// A short name for this strategy, used in diagnostics and errors.
    fn name(&self) -> &'static str;

    /// The number of cells, including zero cells.
    fn len(&self) -> usize;

    /// The number of cells whose value is greater than [`LOG_ZERO`].
    fn occupied(&self) -> usize;

    /// Reads the log-value of a cell.
    fn value(&self, index: usize) -> f64;

    /// Writes the log-value of a cell.
    fn set_value(&mut self, index: usize, value: f64) -> Result<()>;

    /// Returns every cell that is not zero, in no particular order.
    fn cells(&self) -> Box<dyn Iterator<Item = (usize, f64)> + '_>;

    /// Reads the density attachment of a cell.
    fn jdf(&self, index: usize) -> Option<&Jdf<D>>;

    /// Returns the density attachment of a cell, creating an empty one if necessary.
    fn jdf_mut(&mut self, index: usize) -> Result<&mut Jdf<D>>;

    /// Reads the assignment trace of a cell.
    fn trace(&self, index: usize) -> Option<&Trace>;

    /// Returns the assignment trace of a cell, creating an empty one if necessary.
    fn trace_mut(&mut self, index: usize) -> Result<&mut Trace>;

    /// Returns `true` if any cell has a density attachment.
    fn has_densities(&self) -> bool;

    /// Returns `true` if any cell has an assignment trace.
    fn has_traces(&self) -> bool;

    /// Returns the shared block behind this storage, if it has one.
    fn block(&self) -> Option<&Arc<CachedBlock>> {
        None
    }

    /// Copies this storage into a new box.
    fn boxed_clone(&self) -> Box<dyn Storage<D>>;
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        LOG_ZERO
    } else {
        value
    }
}

/// Dense storage: a flat array of log-values, plus parallel arrays of densities and traces that
/// are only allocated once something is written to them.
#[derive(Clone, Debug)]
pub struct DenseStorage<D> {
    values: Vec<f64>,
    occupied: usize,
    densities: Option<Vec<Option<Jdf<D>>>>,
    traces: Option<Vec<Option<Trace>>>,
}

impl<D: Density> DenseStorage<D> {
    /// Creates storage for `size` cells, all zero.
    pub fn new(size: usize) -> Self {
        DenseStorage {
            values: vec![LOG_ZERO; size],
            occupied: 0,
            densities: None,
            traces: None,
        }
    }

    /// Creates storage for a single cell holding `value`.
    pub fn single(value: f64) -> Self {
        let value = sanitize(value);
        DenseStorage {
            values: vec![value],
            occupied: if value > LOG_ZERO { 1 } else { 0 },
            densities: None,
            traces: None,
        }
    }
}

impl<D: Density> Storage<D> for DenseStorage<D> {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn occupied(&self) -> usize {
        self.occupied
    }

    fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    fn set_value(&mut self, index: usize, value: f64) -> Result<()> {
        let value = sanitize(value);
        let old = replace(&mut self.values[index], value);
        match (old > LOG_ZERO, value > LOG_ZERO) {
            (false, true) => self.occupied += 1,
            (true, false) => self.occupied -= 1,
            _ => {}
        }
        Ok(())
    }

    fn cells(&self) -> Box<dyn Iterator<Item = (usize, f64)> + '_> {
        Box::new(
            self.values
                .iter()
                .copied()
                .enumerate()
                .filter(|&(_, value)| value > LOG_ZERO),
        )
    }

    fn jdf(&self, index: usize) -> Option<&Jdf<D>> {
        self.densities.as_ref()?[index].as_ref()
    }

    fn jdf_mut(&mut self, index: usize) -> Result<&mut Jdf<D>> {
        let size = self.values.len();
        let densities = self.densities.get_or_insert_with(|| vec![None; size]);
        Ok(densities[index].get_or_insert_with(Jdf::new))
    }

    fn trace(&self, index: usize) -> Option<&Trace> {
        self.traces.as_ref()?[index].as_ref()
    }

    fn trace_mut(&mut self, index: usize) -> Result<&mut Trace> {
        let size = self.values.len();
        let traces = self.traces.get_or_insert_with(|| vec![None; size]);
        Ok(traces[index].get_or_insert_with(Trace::new))
    }

    fn has_densities(&self) -> bool {
        self.densities.is_some()
    }

    fn has_traces(&self) -> bool {
        self.traces.is_some()
    }

    fn boxed_clone(&self) -> Box<dyn Storage<D>> {
        Box::new(self.clone())
    }
}

/// Sparse storage: only cells that are not zero are kept, keyed by flat index.
///
/// Writing zero to a cell removes its entry, so the number of entries is always the occupancy.
#[derive(Clone, Debug)]
pub struct SparseStorage<D> {
    size: usize,
    values: HashMap<usize, f64>,
    densities: HashMap<usize, Jdf<D>>,
    traces: HashMap<usize, Trace>,
}

impl<D: Density> SparseStorage<D> {
    /// Creates storage for `size` cells, all zero.
    pub fn new(size: usize) -> Self {
        SparseStorage {
            size,
            values: HashMap::new(),
            densities: HashMap::new(),
            traces: HashMap::new(),
        }
    }
}

impl<D: Density> Storage<D> for SparseStorage<D> {
    fn name(&self) -> &'static str {
        "sparse"
    }

    fn len(&self) -> usize {
        self.size
    }

    fn occupied(&self) -> usize {
        self.values.len()
    }

    fn value(&self, index: usize) -> f64 {
        self.values.get(&index).copied().unwrap_or(LOG_ZERO)
    }

    fn set_value(&mut self, index: usize, value: f64) -> Result<()> {
        let value = sanitize(value);
        if value > LOG_ZERO {
            self.values.insert(index, value);
        } else {
            self.values.remove(&index);
        }
        Ok(())
    }

    fn cells(&self) -> Box<dyn Iterator<Item = (usize, f64)> + '_> {
        Box::new(self.values.iter().map(|(&index, &value)| (index, value)))
    }

    fn jdf(&self, index: usize) -> Option<&Jdf<D>> {
        self.densities.get(&index)
    }

    fn jdf_mut(&mut self, index: usize) -> Result<&mut Jdf<D>> {
        Ok(self.densities.entry(index).or_insert_with(Jdf::new))
    }

    fn trace(&self, index: usize) -> Option<&Trace> {
        self.traces.get(&index)
    }

    fn trace_mut(&mut self, index: usize) -> Result<&mut Trace> {
        Ok(self.traces.entry(index).or_insert_with(Trace::new))
    }

    fn has_densities(&self) -> bool {
        !self.densities.is_empty()
    }

    fn has_traces(&self) -> bool {
        !self.traces.is_empty()
    }

    fn boxed_clone(&self) -> Box<dyn Storage<D>> {
        Box::new(self.clone())
    }
}

/// An immutable block of log-values that several factors may share through a
/// [`FactorCache`][crate::FactorCache].
#[derive(Debug, PartialEq)]
pub struct CachedBlock {
    values: Box<[f64]>,
    occupied: usize,
}

impl CachedBlock {
    /// Copies the log-values out of any storage.
    pub(crate) fn from_storage<D: Density>(storage: &dyn Storage<D>) -> Self {
        let mut values = vec![LOG_ZERO; storage.len()].into_boxed_slice();
        for (index, value) in storage.cells() {
            values[index] = value;
        }
        CachedBlock {
            values,
            occupied: storage.occupied(),
        }
    }

    /// The number of cells in the block.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the block has no cells.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The log-values, in flat-index order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Read-only storage backed by a shared [`CachedBlock`].
///
/// Cached cells carry no densities or traces, and every write fails with
/// [`FactorError::Unsupported`].
#[derive(Clone, Debug)]
pub struct CachedStorage(pub(crate) Arc<CachedBlock>);

impl CachedStorage {
    fn unsupported<T>(operation: &'static str) -> Result<T> {
        Err(FactorError::Unsupported {
            operation,
            storage: "cached",
        })
    }
}

impl<D: Density> Storage<D> for CachedStorage {
    fn name(&self) -> &'static str {
        "cached"
    }

    fn len(&self) -> usize {
        self.0.values.len()
    }

    fn occupied(&self) -> usize {
        self.0.occupied
    }

    fn value(&self, index: usize) -> f64 {
        self.0.values[index]
    }

    fn set_value(&mut self, _index: usize, _value: f64) -> Result<()> {
        CachedStorage::unsupported("writing a value")
    }

    fn cells(&self) -> Box<dyn Iterator<Item = (usize, f64)> + '_> {
        Box::new(
            self.0
                .values
                .iter()
                .copied()
                .enumerate()
                .filter(|&(_, value)| value > LOG_ZERO),
        )
    }

    fn jdf(&self, _index: usize) -> Option<&Jdf<D>> {
        None
    }

    fn jdf_mut(&mut self, _index: usize) -> Result<&mut Jdf<D>> {
        CachedStorage::unsupported("attaching a density")
    }

    fn trace(&self, _index: usize) -> Option<&Trace> {
        None
    }

    fn trace_mut(&mut self, _index: usize) -> Result<&mut Trace> {
        CachedStorage::unsupported("recording a trace")
    }

    fn has_densities(&self) -> bool {
        false
    }

    fn has_traces(&self) -> bool {
        false
    }

    fn block(&self) -> Option<&Arc<CachedBlock>> {
        Some(&self.0)
    }

    fn boxed_clone(&self) -> Box<dyn Storage<D>> {
        Box::new(self.clone())
    }
}
