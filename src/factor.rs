use crate::cache::FactorCache;
use crate::density::{Density, Jdf, Mixture};
use crate::error::{FactorError, Result};
use crate::factorize::cross_reference;
use crate::storage::{CachedBlock, CachedStorage, DenseStorage, Storage, StorageKind};
use crate::variable::{ContinuousVariable, EnumVariable, Variable};
use crate::{log_sum_of_logs, LOG_ZERO};
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::sync::Arc;

/// One domain position per enumerable variable of a factor, in the factor's variable order.
pub type Key = SmallVec<[usize; 8]>;

/// A table of log-probabilities over a set of variables.
///
/// Enumerable variables are kept sorted by canonical index, and that order defines the flat
/// index of every cell: the table is laid out row-major, with the last variable varying fastest.
/// A factor with no enumerable variables is *atomic* and has exactly one cell.
///
/// Cells hold natural logarithms. Probability zero is [`LOG_ZERO`], and every cell starts there.
///
/// ```
/// use factor_tables::{EnumVariable, Factor};
///
/// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
/// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
///
/// // Construction sorts and de-duplicates the variables.
/// let mut f: Factor = Factor::new(&[b.clone(), a.clone(), b.clone()]).unwrap();
/// assert_eq!(f.enum_vars(), &[a.clone(), b.clone()]);
/// assert_eq!(f.size(), 6);
///
/// let key = f.key_of(&["f", "y"]).unwrap();
/// assert_eq!(f.get_index(&key).unwrap(), 4);
/// assert_eq!(&f.get_key(4).unwrap()[..], &[1, 1]);
///
/// f.set_probability(&key, 0.5).unwrap();
/// assert_eq!(f.occupied(), 1);
/// assert!((f.sum() - 0.5).abs() < 1e-12);
/// ```
pub struct Factor<D: Density = Mixture> {
    enum_vars: SmallVec<[EnumVariable; 4]>,
    non_enum_vars: SmallVec<[ContinuousVariable; 2]>,
    dom_size: SmallVec<[usize; 4]>,
    step: SmallVec<[usize; 4]>,
    period: SmallVec<[usize; 4]>,
    size: usize,
    traced: bool,
    storage: Box<dyn Storage<D>>,
}

impl<D: Density> Factor<D> {
    /// Creates a factor with dense storage over the given variables.
    ///
    /// The variables may be in any order and may contain duplicates.
    pub fn new<I, V>(variables: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Variable>,
    {
        Factor::with_storage(variables, StorageKind::Dense)
    }

    /// Creates a factor with sparse storage over the given variables.
    pub fn sparse<I, V>(variables: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Variable>,
    {
        Factor::with_storage(variables, StorageKind::Sparse)
    }

    /// Creates a factor over the given variables, backed by the given kind of storage.
    pub fn with_storage<I, V>(variables: I, kind: StorageKind) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Variable>,
    {
        let mut enum_vars = SmallVec::new();
        let mut non_enum_vars = SmallVec::new();
        for variable in variables {
            match variable.into() {
                Variable::Enumerable(v) => enum_vars.push(v),
                Variable::Continuous(v) => non_enum_vars.push(v),
            }
        }
        enum_vars.sort_unstable();
        enum_vars.dedup();
        non_enum_vars.sort_unstable();
        non_enum_vars.dedup();
        Factor::from_sorted(enum_vars, non_enum_vars, kind, false)
    }

    /// Creates an atomic factor holding a single log-value.
    ///
    /// ```
    /// use factor_tables::Factor;
    ///
    /// let one: Factor = Factor::atomic(0.0);
    /// assert!(one.is_atomic());
    /// assert_eq!(one.atomic_value().unwrap(), 0.0);
    /// assert!(one.value(0).is_err());
    /// ```
    pub fn atomic(log_value: f64) -> Self {
        Factor {
            enum_vars: SmallVec::new(),
            non_enum_vars: SmallVec::new(),
            dom_size: SmallVec::new(),
            step: SmallVec::new(),
            period: SmallVec::new(),
            size: 1,
            traced: false,
            storage: Box::new(DenseStorage::single(log_value)),
        }
    }

    pub(crate) fn from_sorted(
        enum_vars: SmallVec<[EnumVariable; 4]>,
        non_enum_vars: SmallVec<[ContinuousVariable; 2]>,
        kind: StorageKind,
        traced: bool,
    ) -> Result<Self> {
        debug_assert!(enum_vars.windows(2).all(|w| w[0] < w[1]));
        let n = enum_vars.len();
        let dom_size: SmallVec<[usize; 4]> = enum_vars.iter().map(|v| v.size()).collect();
        let mut step = smallvec![0; n];
        let mut period = smallvec![0; n];
        let mut size = 1usize;
        for i in (0..n).rev() {
            step[i] = size;
            size = size.checked_mul(dom_size[i]).ok_or_else(|| {
                FactorError::schema(format!(
                    "a table over {:?} has too many cells to index",
                    enum_vars
                ))
            })?;
            period[i] = size;
        }
        Ok(Factor {
            storage: kind.create(size),
            enum_vars,
            non_enum_vars,
            dom_size,
            step,
            period,
            size,
            traced,
        })
    }

    /// Returns this factor with assignment tracing enabled, so that
    /// [`add_trace`][Factor::add_trace] and [`set_trace`][Factor::set_trace] are allowed.
    pub fn with_tracing(mut self) -> Self {
        self.traced = true;
        self
    }

    /// The enumerable variables, sorted by canonical index.
    pub fn enum_vars(&self) -> &[EnumVariable] {
        &self.enum_vars
    }

    /// The continuous variables, sorted by canonical index.
    pub fn non_enum_vars(&self) -> &[ContinuousVariable] {
        &self.non_enum_vars
    }

    /// The domain size of each enumerable variable.
    pub fn dom_sizes(&self) -> &[usize] {
        &self.dom_size
    }

    /// For each enumerable variable, the product of the domain sizes of the variables after it.
    pub fn steps(&self) -> &[usize] {
        &self.step
    }

    /// For each enumerable variable, the product of its own domain size and those after it.
    pub fn periods(&self) -> &[usize] {
        &self.period
    }

    /// The number of cells. An atomic factor has one.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` if this factor has no enumerable variables.
    pub fn is_atomic(&self) -> bool {
        self.enum_vars.is_empty()
    }

    /// Returns `true` if this factor records assignment traces.
    pub fn is_traced(&self) -> bool {
        self.traced
    }

    /// The number of cells that are not zero.
    pub fn occupied(&self) -> usize {
        self.storage.occupied()
    }

    /// Returns `true` if every cell is zero. That's a valid result of an operation, not an error.
    pub fn is_degenerate(&self) -> bool {
        self.storage.occupied() == 0
    }

    /// Fails with [`FactorError::Degenerate`], carrying this factor's diagnostic dump, if every
    /// cell is zero.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor, FactorError};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let mut f: Factor = Factor::new(&[a]).unwrap();
    /// assert!(matches!(f.ensure_nondegenerate(), Err(FactorError::Degenerate(_))));
    /// f.set_value(1, -1.0).unwrap();
    /// assert!(f.ensure_nondegenerate().is_ok());
    /// ```
    pub fn ensure_nondegenerate(&self) -> Result<()> {
        if self.is_degenerate() {
            Err(FactorError::Degenerate(self.to_string()))
        } else {
            Ok(())
        }
    }

    /// The storage backing this factor.
    pub fn storage(&self) -> &dyn Storage<D> {
        &*self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut dyn Storage<D> {
        &mut *self.storage
    }

    /// Returns every cell that is not zero as `(index, log_value)`, in no particular order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.storage.cells()
    }

    fn require_enumerable(&self) -> Result<()> {
        if self.is_atomic() {
            Err(FactorError::schema(
                "indexed access to a factor with no enumerable variables",
            ))
        } else {
            Ok(())
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        self.require_enumerable()?;
        if index < self.size {
            Ok(())
        } else {
            Err(FactorError::Index {
                index,
                size: self.size,
            })
        }
    }

    fn check_key_len(&self, len: usize) -> Result<()> {
        self.require_enumerable()?;
        if len == self.enum_vars.len() {
            Ok(())
        } else {
            Err(FactorError::schema(format!(
                "key has {} entries but the factor has {} enumerable variables",
                len,
                self.enum_vars.len()
            )))
        }
    }

    fn check_domain(&self, position: usize, value: usize) -> Result<()> {
        if value < self.dom_size[position] {
            Ok(())
        } else {
            Err(FactorError::schema(format!(
                "value {} is outside the domain of {}",
                value, self.enum_vars[position]
            )))
        }
    }

    fn atomic_slot(&self) -> Result<usize> {
        if self.is_atomic() {
            Ok(0)
        } else {
            Err(FactorError::schema(format!(
                "atomic access to a factor over {:?}",
                self.enum_vars
            )))
        }
    }

    /// Computes the flat index of a complete key.
    pub fn get_index(&self, key: &[usize]) -> Result<usize> {
        self.check_key_len(key.len())?;
        let mut index = 0;
        for (i, &value) in key.iter().enumerate() {
            self.check_domain(i, value)?;
            index += value * self.step[i];
        }
        Ok(index)
    }

    /// Computes the key of a flat index. This is the inverse of [`get_index`][Factor::get_index].
    pub fn get_key(&self, index: usize) -> Result<Key> {
        self.check_index(index)?;
        Ok(self
            .step
            .iter()
            .zip(self.dom_size.iter())
            .map(|(&step, &size)| index / step % size)
            .collect())
    }

    /// Translates value tokens, one per enumerable variable in order, into a key.
    pub fn key_of(&self, tokens: &[&str]) -> Result<Key> {
        self.check_key_len(tokens.len())?;
        tokens
            .iter()
            .zip(self.enum_vars.iter())
            .map(|(token, variable)| {
                variable.index_of(token).ok_or_else(|| {
                    FactorError::schema(format!("{} has no value {}", variable, token))
                })
            })
            .collect()
    }

    /// Returns `true` if `index` agrees with every specified entry of a partial key. `None`
    /// entries match anything.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
    /// let f: Factor = Factor::new(&[a, b]).unwrap();
    ///
    /// assert!(f.is_match(&[None, Some(2)], 5).unwrap());
    /// assert!(!f.is_match(&[Some(0), Some(2)], 5).unwrap());
    /// assert!(f.is_match(&[None, None], 0).unwrap());
    /// ```
    pub fn is_match(&self, key: &[Option<usize>], index: usize) -> Result<bool> {
        self.check_key_len(key.len())?;
        self.check_index(index)?;
        Ok(key.iter().enumerate().all(|(i, value)| match value {
            Some(value) => index / self.step[i] % self.dom_size[i] == *value,
            None => true,
        }))
    }

    /// Returns every flat index that agrees with a partial key, in ascending order.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
    /// let f: Factor = Factor::new(&[a, b]).unwrap();
    ///
    /// assert_eq!(f.get_indices(&[Some(1), None]).unwrap(), vec![3, 4, 5]);
    /// assert_eq!(f.get_indices(&[None, Some(1)]).unwrap(), vec![1, 4]);
    /// assert_eq!(f.get_indices(&[Some(0), Some(2)]).unwrap(), vec![2]);
    /// ```
    pub fn get_indices(&self, key: &[Option<usize>]) -> Result<Vec<usize>> {
        self.check_key_len(key.len())?;
        let mut base = 0;
        let mut count = 1;
        for (i, value) in key.iter().enumerate() {
            match *value {
                Some(value) => {
                    self.check_domain(i, value)?;
                    base += value * self.step[i];
                }
                None => count *= self.dom_size[i],
            }
        }

        fn expand(
            indices: &mut Vec<usize>,
            key: &[Option<usize>],
            dom_size: &[usize],
            step: &[usize],
            base: usize,
        ) {
            match key.split_first() {
                None => indices.push(base),
                Some((Some(_), rest)) => expand(indices, rest, &dom_size[1..], &step[1..], base),
                Some((None, rest)) => {
                    for value in 0..dom_size[0] {
                        expand(
                            indices,
                            rest,
                            &dom_size[1..],
                            &step[1..],
                            base + value * step[0],
                        );
                    }
                }
            }
        }

        let mut indices = Vec::with_capacity(count);
        expand(&mut indices, key, &self.dom_size, &self.step, base);
        Ok(indices)
    }

    /// Translates an index of this factor into the index of the same instantiation in a table
    /// laid out over `order`, which must contain only variables of this factor (in any order,
    /// possibly fewer of them).
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
    /// let f: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
    ///
    /// // A=f, B=y is index 4 in (A, B) order, but index 3 in (B, A) order.
    /// assert_eq!(f.re_index(4, &[b.clone(), a.clone()]).unwrap(), 3);
    /// assert_eq!(f.re_index(4, &[b.clone()]).unwrap(), 1);
    /// ```
    pub fn re_index(&self, index: usize, order: &[EnumVariable]) -> Result<usize> {
        self.check_index(index)?;
        let positions = cross_reference(order, &self.enum_vars);
        if let Some(missing) = positions.iter().position(Option::is_none) {
            return Err(FactorError::schema(format!(
                "{} is not a variable of this factor",
                order[missing]
            )));
        }
        let steps = strides(order.iter());
        Ok(Projection::new(self, order, &steps).apply(index))
    }

    /// Translates an index of this factor into the index of the same instantiation in a factor
    /// with the variables in `drop` removed. Variables in `drop` that this factor doesn't have
    /// are ignored.
    ///
    /// This takes time linear in the number of variables.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
    /// let f: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
    ///
    /// assert_eq!(f.mask_index(4, &[a.clone()]).unwrap(), 1);
    /// assert_eq!(f.mask_index(4, &[b.clone()]).unwrap(), 1);
    /// ```
    pub fn mask_index(&self, index: usize, drop: &[EnumVariable]) -> Result<usize> {
        self.check_index(index)?;
        let positions = cross_reference(&self.enum_vars, drop);
        let mut masked = 0;
        let mut target_step = 1;
        for i in (0..self.enum_vars.len()).rev() {
            if positions[i].is_none() {
                masked += index / self.step[i] % self.dom_size[i] * target_step;
                target_step *= self.dom_size[i];
            }
        }
        Ok(masked)
    }

    /// Reads the log-value of a cell.
    pub fn value(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        Ok(self.storage.value(index))
    }

    /// Reads the log-value of a cell by key.
    pub fn value_by_key(&self, key: &[usize]) -> Result<f64> {
        let index = self.get_index(key)?;
        Ok(self.storage.value(index))
    }

    /// Reads the single log-value of an atomic factor.
    pub fn atomic_value(&self) -> Result<f64> {
        let slot = self.atomic_slot()?;
        Ok(self.storage.value(slot))
    }

    /// Reads a cell by key as a probability rather than a log-value.
    pub fn probability(&self, key: &[usize]) -> Result<f64> {
        self.value_by_key(key).map(f64::exp)
    }

    /// Writes the log-value of a cell. `NaN` is stored as [`LOG_ZERO`].
    pub fn set_value(&mut self, index: usize, log_value: f64) -> Result<()> {
        self.check_index(index)?;
        self.storage.set_value(index, log_value)
    }

    /// Writes the log-value of a cell by key.
    pub fn set_value_by_key(&mut self, key: &[usize], log_value: f64) -> Result<()> {
        let index = self.get_index(key)?;
        self.storage.set_value(index, log_value)
    }

    /// Writes the single log-value of an atomic factor.
    pub fn set_atomic_value(&mut self, log_value: f64) -> Result<()> {
        let slot = self.atomic_slot()?;
        self.storage.set_value(slot, log_value)
    }

    /// Writes a cell by key as a probability, storing its logarithm.
    pub fn set_probability(&mut self, key: &[usize], probability: f64) -> Result<()> {
        self.set_value_by_key(key, probability.ln())
    }

    fn check_continuous(&self, variable: &ContinuousVariable) -> Result<()> {
        if self.non_enum_vars.binary_search(variable).is_ok() {
            Ok(())
        } else {
            Err(FactorError::schema(format!(
                "{} is not a continuous variable of this factor",
                variable
            )))
        }
    }

    /// Reads the whole density attachment of a cell.
    pub fn jdf(&self, index: usize) -> Result<Option<&Jdf<D>>> {
        self.check_index(index)?;
        Ok(self.storage.jdf(index))
    }

    /// Reads the whole density attachment of an atomic factor.
    pub fn atomic_jdf(&self) -> Result<Option<&Jdf<D>>> {
        let slot = self.atomic_slot()?;
        Ok(self.storage.jdf(slot))
    }

    /// Reads the density attached to one continuous variable of a cell.
    pub fn density(&self, index: usize, variable: &ContinuousVariable) -> Result<Option<&D>> {
        self.check_continuous(variable)?;
        Ok(self.jdf(index)?.and_then(|jdf| jdf.get(variable)))
    }

    /// Reads the density attached to one continuous variable of an atomic factor.
    pub fn atomic_density(&self, variable: &ContinuousVariable) -> Result<Option<&D>> {
        self.check_continuous(variable)?;
        Ok(self.atomic_jdf()?.and_then(|jdf| jdf.get(variable)))
    }

    /// Attaches a density for one continuous variable to a cell, replacing any previous one.
    pub fn set_density(
        &mut self,
        index: usize,
        variable: &ContinuousVariable,
        density: D,
    ) -> Result<()> {
        self.check_index(index)?;
        self.check_continuous(variable)?;
        self.storage
            .jdf_mut(index)?
            .insert(variable.clone(), density);
        Ok(())
    }

    /// Attaches a density for one continuous variable to an atomic factor.
    pub fn set_atomic_density(&mut self, variable: &ContinuousVariable, density: D) -> Result<()> {
        let slot = self.atomic_slot()?;
        self.check_continuous(variable)?;
        self.storage.jdf_mut(slot)?.insert(variable.clone(), density);
        Ok(())
    }

    fn check_traced(&self) -> Result<()> {
        if self.traced {
            Ok(())
        } else {
            Err(FactorError::schema("tracing is not enabled on this factor"))
        }
    }

    /// Reads the assignment trace of a cell.
    pub fn trace(&self, index: usize) -> Result<Option<&Trace>> {
        self.check_index(index)?;
        Ok(self.storage.trace(index))
    }

    /// Reads the assignment trace of an atomic factor.
    pub fn atomic_trace(&self) -> Result<Option<&Trace>> {
        let slot = self.atomic_slot()?;
        Ok(self.storage.trace(slot))
    }

    /// Adds one assignment to the trace of a cell.
    pub fn add_trace(&mut self, index: usize, variable: &EnumVariable, value: usize) -> Result<()> {
        self.check_index(index)?;
        self.add_trace_at(index, variable, value)
    }

    /// Adds one assignment to the trace of an atomic factor.
    pub fn add_atomic_trace(&mut self, variable: &EnumVariable, value: usize) -> Result<()> {
        let slot = self.atomic_slot()?;
        self.add_trace_at(slot, variable, value)
    }

    fn add_trace_at(&mut self, slot: usize, variable: &EnumVariable, value: usize) -> Result<()> {
        self.check_traced()?;
        if value >= variable.size() {
            return Err(FactorError::schema(format!(
                "value {} is outside the domain of {}",
                value, variable
            )));
        }
        self.storage
            .trace_mut(slot)?
            .insert(variable.clone(), value);
        Ok(())
    }

    /// Replaces the trace of a cell.
    pub fn set_trace(&mut self, index: usize, trace: Trace) -> Result<()> {
        self.check_index(index)?;
        self.check_traced()?;
        *self.storage.trace_mut(index)? = trace;
        Ok(())
    }

    /// Replaces the trace of an atomic factor.
    pub fn set_atomic_trace(&mut self, trace: Trace) -> Result<()> {
        let slot = self.atomic_slot()?;
        self.check_traced()?;
        *self.storage.trace_mut(slot)? = trace;
        Ok(())
    }

    /// The logarithm of the total probability mass in this factor.
    pub fn log_sum(&self) -> f64 {
        self.storage
            .cells()
            .map(|(_, value)| value)
            .filter(|value| !value.is_nan())
            .fold(LOG_ZERO, log_sum_of_logs)
    }

    /// The total probability mass in this factor.
    pub fn sum(&self) -> f64 {
        self.log_sum().exp()
    }

    /// Summarizes the probability mass in this factor.
    ///
    /// The entropy is computed from log-values relative to [`log_sum`][Factor::log_sum], so it
    /// holds up for factors whose cells would underflow as plain probabilities.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let mut f: Factor = Factor::new(&[a]).unwrap();
    /// assert_eq!(f.summary().entropy, 0.0);
    /// assert_eq!(f.summary().occupied, 0);
    ///
    /// f.set_probability(&[0], 1.0).unwrap();
    /// assert!(f.summary().entropy.abs() < 1e-12);
    ///
    /// f.set_probability(&[1], 1.0).unwrap();
    /// let summary = f.summary();
    /// assert!((summary.entropy - 1.0).abs() < 1e-12);
    /// assert!((summary.mass() - 2.0).abs() < 1e-12);
    /// assert_eq!(summary.occupied, 2);
    /// ```
    pub fn summary(&self) -> FactorSummary {
        let log_mass = self.log_sum();
        let entropy = if log_mass == LOG_ZERO {
            0.0
        } else {
            let nats: f64 = self
                .storage
                .cells()
                .map(|(_, value)| value - log_mass)
                .map(|log_p| -log_p.exp() * log_p)
                .sum();
            (nats / std::f64::consts::LN_2).max(0.0)
        };
        FactorSummary {
            entropy,
            log_mass,
            occupied: self.occupied(),
        }
    }

    /// Returns a copy of this factor whose log-values live in a block shared through `cache`.
    ///
    /// If an identical block is already cached, the copy shares it. Factors carrying densities
    /// or traces are copied unchanged, since cached blocks hold log-values only.
    ///
    /// The copy is read-only: writing to it fails with [`FactorError::Unsupported`].
    pub fn share(&self, cache: &FactorCache) -> Self {
        self.clone().into_shared(cache)
    }

    /// Like [`share`][Factor::share], but consumes this factor.
    pub fn into_shared(self, cache: &FactorCache) -> Self {
        if self.traced
            || self.storage.has_densities()
            || self.storage.has_traces()
            || self.storage.block().is_some()
        {
            return self;
        }
        let fingerprint = FactorCache::fingerprint(&self);
        let own = || Arc::new(CachedBlock::from_storage(&*self.storage));
        let block = match cache.get(fingerprint) {
            Some(block) if self.same_values(&block) => block,
            Some(_) => own(),
            None => {
                let block = cache.put(fingerprint, own());
                if self.same_values(&block) {
                    block
                } else {
                    own()
                }
            }
        };
        self.with_storage_box(Box::new(CachedStorage(block)))
    }

    fn same_values(&self, block: &CachedBlock) -> bool {
        block.len() == self.size
            && block
                .values()
                .iter()
                .enumerate()
                .all(|(index, &value)| self.storage.value(index).to_bits() == value.to_bits())
    }

    fn with_storage_box(&self, storage: Box<dyn Storage<D>>) -> Self {
        Factor {
            enum_vars: self.enum_vars.clone(),
            non_enum_vars: self.non_enum_vars.clone(),
            dom_size: self.dom_size.clone(),
            step: self.step.clone(),
            period: self.period.clone(),
            size: self.size,
            traced: self.traced,
            storage,
        }
    }

    /// Creates an all-zero factor with the same schema as this one.
    pub(crate) fn empty_like(&self, kind: StorageKind) -> Self {
        self.with_storage_box(kind.create(self.size))
    }

    /// Copies this factor, moving shared read-only cells onto fresh dense storage.
    pub(crate) fn to_writable(&self) -> Result<Self> {
        if self.storage.block().is_none() {
            return Ok(self.clone());
        }
        let mut copy = self.empty_like(StorageKind::Dense);
        for (index, value) in self.cells() {
            copy.storage.set_value(index, value)?;
        }
        Ok(copy)
    }
}

impl<D: Density> Clone for Factor<D> {
    fn clone(&self) -> Self {
        self.with_storage_box(self.storage.boxed_clone())
    }
}

impl<D: Density> fmt::Debug for Factor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factor")
            .field("enum_vars", &self.enum_vars)
            .field("non_enum_vars", &self.non_enum_vars)
            .field("size", &self.size)
            .field("occupied", &self.storage.occupied())
            .field("storage", &self.storage.name())
            .finish()
    }
}

/// The diagnostic dump: a header describing the schema, then one tab-separated row per non-zero
/// cell in index order. This format is meant for people and may change.
impl<D: Density> fmt::Display for Factor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factor(")?;
        for (i, variable) in self.enum_vars.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", variable)?;
        }
        if !self.non_enum_vars.is_empty() {
            f.write_str(" | ")?;
            for (i, variable) in self.non_enum_vars.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", variable)?;
            }
        }
        writeln!(
            f,
            ") {} storage, {} of {} cells occupied",
            self.storage.name(),
            self.storage.occupied(),
            self.size
        )?;

        for variable in self.enum_vars.iter() {
            write!(f, "{}\t", variable)?;
        }
        f.write_str("log\tp")?;
        let densities = self.storage.has_densities();
        let traces = self.storage.has_traces();
        if densities {
            f.write_str("\tdensity")?;
        }
        if traces {
            f.write_str("\ttrace")?;
        }
        writeln!(f)?;

        let mut cells: Vec<_> = self.storage.cells().collect();
        cells.sort_unstable_by_key(|&(index, _)| index);
        for (index, value) in cells {
            for (i, variable) in self.enum_vars.iter().enumerate() {
                let position = index / self.step[i] % self.dom_size[i];
                write!(f, "{}\t", variable.value(position).unwrap_or("?"))?;
            }
            write!(f, "{:.6}\t{:.6}", value, value.exp())?;
            if densities {
                match self.storage.jdf(index) {
                    Some(jdf) => write!(f, "\t{}", jdf)?,
                    None => f.write_str("\t-")?,
                }
            }
            if traces {
                match self.storage.trace(index) {
                    Some(trace) => write!(f, "\t{}", trace)?,
                    None => f.write_str("\t-")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Computes row-major strides for a table over the given variables, in the given order.
pub(crate) fn strides<'a, I>(variables: I) -> SmallVec<[usize; 8]>
where
    I: DoubleEndedIterator<Item = &'a EnumVariable> + ExactSizeIterator,
{
    let mut steps: SmallVec<[usize; 8]> = smallvec![0; variables.len()];
    let mut step = 1;
    for (i, variable) in variables.enumerate().rev() {
        steps[i] = step;
        step *= variable.size();
    }
    steps
}

#[derive(Clone, Copy, Debug)]
struct Term {
    step: usize,
    size: usize,
    target_step: usize,
}

/// Maps indices of one factor to the matching contribution in another table's index, for the
/// variables the two have in common. Variables of the source missing from the target are
/// dropped.
///
/// Building one costs a cross-reference of the two variable lists; applying it costs one divide
/// per shared variable, independent of table size.
#[derive(Clone, Debug)]
pub(crate) struct Projection {
    terms: SmallVec<[Term; 8]>,
}

impl Projection {
    pub(crate) fn new<D: Density>(
        from: &Factor<D>,
        to: &[EnumVariable],
        to_steps: &[usize],
    ) -> Self {
        Projection::filtered(from, to, to_steps, |_| true)
    }

    pub(crate) fn filtered<D, F>(
        from: &Factor<D>,
        to: &[EnumVariable],
        to_steps: &[usize],
        keep: F,
    ) -> Self
    where
        D: Density,
        F: Fn(&EnumVariable) -> bool,
    {
        let positions = cross_reference(&from.enum_vars, to);
        let terms = positions
            .iter()
            .enumerate()
            .filter_map(|(i, position)| {
                let j = (*position)?;
                if keep(&from.enum_vars[i]) {
                    Some(Term {
                        step: from.step[i],
                        size: from.dom_size[i],
                        target_step: to_steps[j],
                    })
                } else {
                    None
                }
            })
            .collect();
        Projection { terms }
    }

    pub(crate) fn apply(&self, index: usize) -> usize {
        self.terms
            .iter()
            .map(|term| index / term.step % term.size * term.target_step)
            .sum()
    }
}

/// The assignments that produced a cell's value: a set of `(variable, value)` pairs with at most
/// one value per variable, ordered by variable.
///
/// Max-marginalization records, for every output cell, which values of the removed variables
/// attained the maximum. Following those records back is how the most probable joint assignment
/// is recovered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Trace(SmallVec<[(EnumVariable, usize); 4]>);

impl Trace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Trace(SmallVec::new())
    }

    /// Records `variable = value`, returning the value previously recorded for that variable.
    pub fn insert(&mut self, variable: EnumVariable, value: usize) -> Option<usize> {
        match self.0.binary_search_by(|(v, _)| v.cmp(&variable)) {
            Ok(at) => Some(std::mem::replace(&mut self.0[at].1, value)),
            Err(at) => {
                self.0.insert(at, (variable, value));
                None
            }
        }
    }

    /// Records every assignment from `other`. Where both record the same variable, `other` wins.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Trace};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["t", "f"]).unwrap();
    ///
    /// let mut left = Trace::new();
    /// left.insert(a.clone(), 0);
    /// let mut right = Trace::new();
    /// right.insert(b.clone(), 1);
    ///
    /// left.extend_from(&right);
    /// assert_eq!(left.get(&a), Some(0));
    /// assert_eq!(left.get(&b), Some(1));
    /// assert_eq!(left.to_string(), "A=t, B=f");
    /// ```
    pub fn extend_from(&mut self, other: &Trace) {
        for (variable, value) in other.0.iter() {
            self.insert(variable.clone(), *value);
        }
    }

    /// Returns the value recorded for `variable`.
    pub fn get(&self, variable: &EnumVariable) -> Option<usize> {
        self.0
            .binary_search_by(|(v, _)| v.cmp(variable))
            .ok()
            .map(|at| self.0[at].1)
    }

    /// The number of recorded assignments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the recorded assignments, ordered by variable.
    pub fn iter(&self) -> impl Iterator<Item = (&EnumVariable, usize)> + '_ {
        self.0.iter().map(|(variable, value)| (variable, *value))
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (variable, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", variable, variable.value(value).unwrap_or("?"))?;
        }
        Ok(())
    }
}

/// Occupancy and spread of the probability mass in a [`Factor`], from
/// [`Factor::summary`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FactorSummary {
    /// Entropy in bits of the factor's cells after normalizing them to sum to one.
    /// Zero for a degenerate factor.
    pub entropy: f64,
    /// The logarithm of the total mass, as in [`Factor::log_sum`].
    pub log_mass: f64,
    /// The number of non-zero cells.
    pub occupied: usize,
}

impl FactorSummary {
    /// The total probability mass.
    pub fn mass(&self) -> f64 {
        self.log_mass.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> (EnumVariable, EnumVariable, EnumVariable) {
        (
            EnumVariable::new(0, "A", &["0", "1"]).unwrap(),
            EnumVariable::new(1, "B", &["0", "1", "2"]).unwrap(),
            EnumVariable::new(2, "C", &["0", "1", "2", "3"]).unwrap(),
        )
    }

    #[test]
    fn strides_are_row_major() {
        let (a, b, c) = vars();
        let f: Factor = Factor::new(&[c.clone(), a.clone(), b.clone()]).unwrap();
        assert_eq!(f.steps(), &[12, 4, 1]);
        assert_eq!(f.periods(), &[24, 12, 4]);
        assert_eq!(f.size(), 24);
        assert_eq!(&strides([a, b, c].iter())[..], &[12, 4, 1]);
    }

    #[test]
    fn projection_drops_missing_variables() {
        let (a, b, c) = vars();
        let f: Factor = Factor::new(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let target = [c.clone(), a.clone()];
        let steps = strides(target.iter());
        let projection = Projection::new(&f, &target, &steps);
        for index in 0..f.size() {
            let key = f.get_key(index).unwrap();
            assert_eq!(projection.apply(index), key[2] * 2 + key[0]);
            assert_eq!(f.re_index(index, &target).unwrap(), key[2] * 2 + key[0]);
            assert_eq!(f.mask_index(index, &[b.clone()]).unwrap(), key[0] * 4 + key[2]);
        }
    }

    #[test]
    fn malformed_keys_are_schema_errors() {
        let (a, b, c) = vars();
        let f: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
        assert!(matches!(f.get_index(&[0]), Err(FactorError::Schema(_))));
        assert!(matches!(f.get_index(&[0, 3]), Err(FactorError::Schema(_))));
        assert!(matches!(f.get_key(6), Err(FactorError::Index { index: 6, size: 6 })));
        assert!(matches!(f.key_of(&["0", "7"]), Err(FactorError::Schema(_))));
        assert!(matches!(f.re_index(0, &[c]), Err(FactorError::Schema(_))));

        let atomic: Factor = Factor::new(Vec::<Variable>::new()).unwrap();
        assert!(atomic.is_atomic());
        assert!(matches!(atomic.get_index(&[]), Err(FactorError::Schema(_))));
        assert!(matches!(f.atomic_value(), Err(FactorError::Schema(_))));
    }

    #[test]
    fn traces_require_tracing() {
        let (a, b, _) = vars();
        let mut f: Factor = Factor::new(&[a.clone()]).unwrap();
        assert!(f.add_trace(0, &b, 1).is_err());

        let mut f = f.with_tracing();
        f.add_trace(0, &b, 1).unwrap();
        assert!(f.add_trace(0, &b, 3).is_err());
        assert_eq!(f.trace(0).unwrap().unwrap().get(&b), Some(1));
        assert_eq!(f.trace(1).unwrap(), None);
    }

    #[test]
    fn summary_survives_underflow() {
        let (_, b, _) = vars();
        let mut f: Factor = Factor::new(&[b]).unwrap();
        f.set_value(0, -5000.0).unwrap();
        f.set_value(2, -5000.0).unwrap();
        assert_eq!(f.sum(), 0.0);

        let summary = f.summary();
        assert!((summary.entropy - 1.0).abs() < 1e-12);
        assert!((summary.log_mass - (-5000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(summary.occupied, 2);

        f.set_value(1, -5000.0 + 2f64.ln()).unwrap();
        assert!((f.summary().entropy - 1.5).abs() < 1e-12);
    }
}
