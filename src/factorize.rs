//! Operations that combine and reduce factors.
//!
//! Every operation here reads its inputs and allocates a fresh output; no input is ever
//! modified.

use crate::cache::FactorCache;
use crate::density::{Density, Jdf};
use crate::error::Result;
use crate::factor::{Factor, Projection};
use crate::storage::StorageKind;
use crate::tree::ProductTree;
use crate::variable::{ContinuousVariable, EnumVariable};
use crate::{log_sum_of_logs, LOG_ZERO};
use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByItemExt;
use sorted_iter::SortedIterator;
use std::collections::HashMap;
use std::sync::Arc;

/// Tuning knobs for [`Factorize`].
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Results with at most this many cells always use dense storage. Bigger results use sparse
    /// storage when they're expected to be less than a quarter full.
    pub sparse_threshold: usize,

    /// When estimating the cost of multiplying two factors in [`Factorize::product_all`], count
    /// the domain of each shared variable twice instead of once.
    pub count_shared_twice: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sparse_threshold: 4096,
            count_shared_twice: false,
        }
    }
}

/// Multiplies, marginalizes, and normalizes factors.
///
/// This holds only configuration and an optional shared [`FactorCache`], so it's cheap to clone
/// and can be used from many threads at once.
///
/// ```
/// use factor_tables::{EnumVariable, Factor, Factorize};
///
/// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
/// let b = EnumVariable::new(1, "B", &["t", "f"]).unwrap();
///
/// let mut prior: Factor = Factor::new(&[a.clone()]).unwrap();
/// prior.set_probability(&[0], 0.3).unwrap();
/// prior.set_probability(&[1], 0.7).unwrap();
///
/// let mut likelihood: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
/// likelihood.set_probability(&[0, 0], 0.9).unwrap();
/// likelihood.set_probability(&[0, 1], 0.1).unwrap();
/// likelihood.set_probability(&[1, 0], 0.2).unwrap();
/// likelihood.set_probability(&[1, 1], 0.8).unwrap();
///
/// let ops = Factorize::new();
/// let joint = ops.product(&prior, &likelihood).unwrap();
/// let p_b = ops.margin(&joint, &[a]).unwrap();
/// assert!((p_b.probability(&[0]).unwrap() - 0.41).abs() < 1e-12);
/// assert!((p_b.probability(&[1]).unwrap() - 0.59).abs() < 1e-12);
/// ```
#[derive(Clone, Default)]
pub struct Factorize {
    options: Options,
    cache: Option<Arc<FactorCache>>,
}

struct Operand<'a, D: Density> {
    factor: &'a Factor<D>,
    index: usize,
    value: f64,
}

impl Factorize {
    /// Creates a coordinator with default options and no cache.
    pub fn new() -> Self {
        Factorize::default()
    }

    /// Creates a coordinator with the given options and no cache.
    pub fn with_options(options: Options) -> Self {
        Factorize {
            options,
            cache: None,
        }
    }

    /// Routes the results of [`product`][Factorize::product] and [`margin`][Factorize::margin]
    /// through `cache`, so that identical results share storage.
    pub fn with_cache(mut self, cache: Arc<FactorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The options this coordinator was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn finish<D: Density>(&self, factor: Factor<D>) -> Factor<D> {
        match &self.cache {
            Some(cache) => factor.into_shared(cache),
            None => factor,
        }
    }

    fn kind_for(&self, enum_vars: &[EnumVariable], expected_occupied: usize) -> StorageKind {
        let size = enum_vars
            .iter()
            .try_fold(1usize, |size, v| size.checked_mul(v.size()))
            .unwrap_or(usize::MAX);
        StorageKind::choose(
            size,
            expected_occupied.min(size),
            self.options.sparse_threshold,
        )
    }

    /// Multiplies two factors.
    ///
    /// The result is over the union of both factors' variables. Cells that are zero on either
    /// side are skipped entirely, leaving the output cell at zero. Density attachments over
    /// disjoint continuous variables are joined, and traces are merged.
    ///
    /// Fails with a schema error if the two sides attach densities to the same continuous
    /// variable in cells that multiply together.
    pub fn product<D: Density>(&self, x: &Factor<D>, y: &Factor<D>) -> Result<Factor<D>> {
        let enum_vars: SmallVec<[EnumVariable; 4]> = x
            .enum_vars()
            .iter()
            .cloned()
            .assume_sorted_by_item()
            .union(y.enum_vars().iter().cloned().assume_sorted_by_item())
            .collect();
        let non_enum_vars: SmallVec<[ContinuousVariable; 2]> = x
            .non_enum_vars()
            .iter()
            .cloned()
            .assume_sorted_by_item()
            .union(y.non_enum_vars().iter().cloned().assume_sorted_by_item())
            .collect();
        let kind = self.kind_for(&enum_vars, x.occupied().saturating_mul(y.occupied()));
        let traced = x.is_traced() || y.is_traced();
        let mut out = Factor::from_sorted(enum_vars, non_enum_vars, kind, traced)?;

        let case = if x.is_atomic() && y.is_atomic() {
            if let (Some(vx), Some(vy)) = (atomic_cell(x), atomic_cell(y)) {
                write_product(&mut out, 0, &Operand::new(x, 0, vx), &Operand::new(y, 0, vy))?;
            }
            "atomic"
        } else if x.is_atomic() || y.is_atomic() {
            let (scalar, table) = if x.is_atomic() { (x, y) } else { (y, x) };
            if let Some(vs) = atomic_cell(scalar) {
                for (i, vt) in table.cells() {
                    write_product(
                        &mut out,
                        i,
                        &Operand::new(scalar, 0, vs),
                        &Operand::new(table, i, vt),
                    )?;
                }
            }
            "broadcast"
        } else if x.enum_vars() == y.enum_vars() {
            for (i, vx) in x.cells() {
                let vy = y.storage().value(i);
                if vy > LOG_ZERO {
                    write_product(&mut out, i, &Operand::new(x, i, vx), &Operand::new(y, i, vy))?;
                }
            }
            "aligned"
        } else {
            let in_x = cross_reference(y.enum_vars(), x.enum_vars());
            if in_x.iter().all(Option::is_some) {
                product_subset(&mut out, x, y)?;
                "subset"
            } else if cross_reference(x.enum_vars(), y.enum_vars())
                .iter()
                .all(Option::is_some)
            {
                product_subset(&mut out, y, x)?;
                "subset"
            } else if in_x.iter().all(Option::is_none) {
                product_disjoint(&mut out, x, y)?;
                "disjoint"
            } else {
                product_overlapping(&mut out, x, y, &in_x)?;
                "overlapping"
            }
        };

        tracing::trace!(
            case,
            x = x.size(),
            y = y.size(),
            out = out.size(),
            occupied = out.occupied(),
            "product"
        );
        if out.is_degenerate() && !x.is_degenerate() && !y.is_degenerate() {
            tracing::warn!(vars = ?out.enum_vars(), "product of non-zero factors is all zero");
        }
        Ok(self.finish(out))
    }

    /// Multiplies any number of factors, choosing the order of pairwise products with a
    /// [`ProductTree`].
    ///
    /// The product of no factors is the atomic factor with log-value 0.
    pub fn product_all<D: Density>(&self, factors: &[&Factor<D>]) -> Result<Factor<D>> {
        ProductTree::build(factors, self.options.count_shared_twice).evaluate(self, factors)
    }

    /// Sums the variables in `remove` out of `x`.
    ///
    /// Each output cell is the log-sum of every cell of `x` that agrees with it. Density
    /// attachments of the summed cells are mixed, weighted by each cell's share of the output
    /// cell's mass. Traces are not carried over. Variables in `remove` that `x` doesn't have are
    /// ignored.
    pub fn margin<D: Density>(&self, x: &Factor<D>, remove: &[EnumVariable]) -> Result<Factor<D>> {
        let (keep, removed) = split_variables(x, remove);
        if removed.is_empty() {
            return Ok(self.finish(x.clone()));
        }

        let kind = self.kind_for(&keep, x.occupied());
        let mut y = Factor::from_sorted(keep, x.non_enum_vars().into(), kind, false)?;
        let projection = Projection::new(x, y.enum_vars(), y.steps());

        for (i, vx) in x.cells() {
            let o = projection.apply(i);
            let storage = y.storage_mut();
            let sum = log_sum_of_logs(storage.value(o), vx);
            storage.set_value(o, sum)?;
        }

        if x.storage().has_densities() {
            let mut cells: Vec<_> = x.cells().collect();
            cells.sort_unstable_by_key(|&(index, _)| index);
            let mut mixed: HashMap<usize, (Jdf<D>, f64)> = HashMap::new();
            for (i, vx) in cells {
                let jdf = match x.storage().jdf(i) {
                    Some(jdf) => jdf,
                    None => continue,
                };
                let o = projection.apply(i);
                let weight = (vx - y.storage().value(o)).exp();
                let next = match mixed.remove(&o) {
                    Some((acc, acc_weight)) => (acc.mix(acc_weight, jdf, weight), acc_weight + weight),
                    None => (jdf.clone(), weight),
                };
                mixed.insert(o, next);
            }
            for (o, (jdf, _)) in mixed {
                *y.storage_mut().jdf_mut(o)? = jdf;
            }
        }

        tracing::trace!(removed = ?removed, out = y.size(), occupied = y.occupied(), "margin");
        if y.is_degenerate() && !x.is_degenerate() {
            tracing::warn!(vars = ?y.enum_vars(), "margin of a non-zero factor is all zero");
        }
        Ok(self.finish(y))
    }

    /// Maximizes the variables in `remove` out of `x`.
    ///
    /// Each output cell takes the largest value among the cells of `x` that agree with it. The
    /// result always has tracing enabled: each output cell records the values of the removed
    /// variables at the maximum, plus whatever trace that maximal cell already carried. Ties go
    /// to the cell with the lowest index.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor, Factorize};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let b = EnumVariable::new(1, "B", &["x", "y", "z"]).unwrap();
    /// let mut f: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
    /// for (index, p) in [0.1f64, 0.5, 0.4, 0.3, 0.3, 0.4].iter().enumerate() {
    ///     f.set_value(index, p.ln()).unwrap();
    /// }
    ///
    /// let best = Factorize::new().max_margin(&f, &[b.clone()]).unwrap();
    /// assert!(best.is_traced());
    /// assert!((best.probability(&[0]).unwrap() - 0.5).abs() < 1e-12);
    /// assert_eq!(best.trace(0).unwrap().unwrap().get(&b), Some(1));
    /// assert_eq!(best.trace(1).unwrap().unwrap().get(&b), Some(2));
    /// ```
    pub fn max_margin<D: Density>(
        &self,
        x: &Factor<D>,
        remove: &[EnumVariable],
    ) -> Result<Factor<D>> {
        let (keep, removed) = split_variables(x, remove);
        if removed.is_empty() {
            return Ok(x.to_writable()?.with_tracing());
        }

        let removed_positions: SmallVec<[(EnumVariable, usize, usize); 4]> = removed
            .iter()
            .filter_map(|variable| {
                let p = x.enum_vars().binary_search(variable).ok()?;
                Some((variable.clone(), x.steps()[p], x.dom_sizes()[p]))
            })
            .collect();

        let kind = self.kind_for(&keep, x.occupied());
        let mut y = Factor::from_sorted(keep, x.non_enum_vars().into(), kind, true)?;
        let projection = Projection::new(x, y.enum_vars(), y.steps());

        let mut best: HashMap<usize, (f64, usize)> = HashMap::new();
        for (i, vx) in x.cells() {
            let o = projection.apply(i);
            let entry = best.entry(o).or_insert((vx, i));
            if vx > entry.0 || (vx == entry.0 && i < entry.1) {
                *entry = (vx, i);
            }
        }

        for (o, (value, i)) in best {
            let storage = y.storage_mut();
            storage.set_value(o, value)?;
            let trace = storage.trace_mut(o)?;
            if let Some(prior) = x.storage().trace(i) {
                trace.extend_from(prior);
            }
            for (variable, step, size) in removed_positions.iter() {
                trace.insert(variable.clone(), i / step % size);
            }
            if let Some(jdf) = x.storage().jdf(i) {
                *storage.jdf_mut(o)? = jdf.clone();
            }
        }

        tracing::trace!(removed = ?removed, out = y.size(), occupied = y.occupied(), "max margin");
        Ok(y)
    }

    /// Rescales `x` so its cells sum to one. Densities and traces are left alone.
    ///
    /// An all-zero factor has nothing to rescale and comes back unchanged.
    ///
    /// ```
    /// use factor_tables::{EnumVariable, Factor, Factorize};
    ///
    /// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
    /// let mut f: Factor = Factor::new(&[a]).unwrap();
    /// f.set_value(0, -1000.0).unwrap();
    /// f.set_value(1, -1000.0 + 3f64.ln()).unwrap();
    ///
    /// let p = Factorize::new().normal(&f).unwrap();
    /// assert!((p.sum() - 1.0).abs() < 1e-12);
    /// assert!((p.probability(&[1]).unwrap() - 0.75).abs() < 1e-12);
    /// ```
    pub fn normal<D: Density>(&self, x: &Factor<D>) -> Result<Factor<D>> {
        let max = x.cells().map(|(_, value)| value).fold(LOG_ZERO, f64::max);
        if max == LOG_ZERO {
            return x.to_writable();
        }
        let total = max
            + x.cells()
                .map(|(_, value)| (value - max).exp())
                .sum::<f64>()
                .ln();

        let mut y = x.to_writable()?;
        for (i, value) in x.cells() {
            y.storage_mut().set_value(i, value - total)?;
        }
        Ok(y)
    }
}

impl<'a, D: Density> Operand<'a, D> {
    fn new(factor: &'a Factor<D>, index: usize, value: f64) -> Self {
        Operand {
            factor,
            index,
            value,
        }
    }
}

fn atomic_cell<D: Density>(factor: &Factor<D>) -> Option<f64> {
    let value = factor.storage().value(0);
    if value > LOG_ZERO {
        Some(value)
    } else {
        None
    }
}

fn write_product<D: Density>(
    out: &mut Factor<D>,
    o: usize,
    x: &Operand<'_, D>,
    y: &Operand<'_, D>,
) -> Result<()> {
    let storage = out.storage_mut();
    storage.set_value(o, x.value + y.value)?;

    let jdf_x = x.factor.storage().jdf(x.index);
    let jdf_y = y.factor.storage().jdf(y.index);
    let jdf = match (jdf_x, jdf_y) {
        (Some(a), Some(b)) => Some(a.combine(b)?),
        (Some(a), None) | (None, Some(a)) => Some(a.clone()),
        (None, None) => None,
    };
    if let Some(jdf) = jdf {
        *storage.jdf_mut(o)? = jdf;
    }

    let trace_x = x.factor.storage().trace(x.index);
    let trace_y = y.factor.storage().trace(y.index);
    if trace_x.is_some() || trace_y.is_some() {
        let trace = storage.trace_mut(o)?;
        for source in trace_x.into_iter().chain(trace_y) {
            trace.extend_from(source);
        }
    }
    Ok(())
}

/// Every variable of `small` is in `big`, so the output is laid out exactly like `big`.
fn product_subset<D: Density>(
    out: &mut Factor<D>,
    big: &Factor<D>,
    small: &Factor<D>,
) -> Result<()> {
    let projection = Projection::new(big, small.enum_vars(), small.steps());
    for (i, vb) in big.cells() {
        let j = projection.apply(i);
        let vs = small.storage().value(j);
        if vs > LOG_ZERO {
            write_product(out, i, &Operand::new(big, i, vb), &Operand::new(small, j, vs))?;
        }
    }
    Ok(())
}

fn product_disjoint<D: Density>(out: &mut Factor<D>, x: &Factor<D>, y: &Factor<D>) -> Result<()> {
    let embed_x = Projection::new(x, out.enum_vars(), out.steps());
    let embed_y = Projection::new(y, out.enum_vars(), out.steps());
    let y_cells: Vec<_> = y
        .cells()
        .map(|(j, vy)| (j, vy, embed_y.apply(j)))
        .collect();
    for (i, vx) in x.cells() {
        let base = embed_x.apply(i);
        for &(j, vy, offset) in y_cells.iter() {
            write_product(
                out,
                base + offset,
                &Operand::new(x, i, vx),
                &Operand::new(y, j, vy),
            )?;
        }
    }
    Ok(())
}

/// The general case: for every non-zero cell of `x`, find the cells of `y` that agree on the
/// shared variables. `in_x` gives, for each variable of `y`, its position in `x`.
fn product_overlapping<D: Density>(
    out: &mut Factor<D>,
    x: &Factor<D>,
    y: &Factor<D>,
    in_x: &[Option<usize>],
) -> Result<()> {
    let embed_x = Projection::new(x, out.enum_vars(), out.steps());
    let embed_y_only = Projection::filtered(y, out.enum_vars(), out.steps(), |v| {
        x.enum_vars().binary_search(v).is_err()
    });
    let mut partial: SmallVec<[Option<usize>; 8]> = SmallVec::with_capacity(in_x.len());
    for (i, vx) in x.cells() {
        let key = x.get_key(i)?;
        partial.clear();
        partial.extend(in_x.iter().map(|position| position.map(|p| key[p])));
        let base = embed_x.apply(i);
        for j in y.get_indices(&partial)? {
            let vy = y.storage().value(j);
            if vy > LOG_ZERO {
                write_product(
                    out,
                    base + embed_y_only.apply(j),
                    &Operand::new(x, i, vx),
                    &Operand::new(y, j, vy),
                )?;
            }
        }
    }
    Ok(())
}

/// Splits the variables of `x` into those to keep and those named in `remove`.
fn split_variables<D: Density>(
    x: &Factor<D>,
    remove: &[EnumVariable],
) -> (SmallVec<[EnumVariable; 4]>, SmallVec<[EnumVariable; 4]>) {
    let positions = cross_reference(x.enum_vars(), remove);
    let mut keep = SmallVec::new();
    let mut removed = SmallVec::new();
    for (variable, position) in x.enum_vars().iter().zip(positions.iter()) {
        if position.is_some() {
            removed.push(variable.clone());
        } else {
            keep.push(variable.clone());
        }
    }
    (keep, removed)
}

/// For each item of `from`, finds its position in `to`.
///
/// When both lists are strictly ascending (as every factor's variable lists are) this is a
/// single merge pass. Otherwise it falls back to a linear search per item.
///
/// ```
/// use factor_tables::factorize::cross_reference;
///
/// assert_eq!(&cross_reference(&[1, 3, 5], &[2, 3, 4, 5])[..], &[None, Some(1), Some(3)]);
/// assert_eq!(&cross_reference(&[5, 1], &[1, 9, 5])[..], &[Some(2), Some(0)]);
/// ```
pub fn cross_reference<T: Ord>(from: &[T], to: &[T]) -> SmallVec<[Option<usize>; 8]> {
    fn ascending<T: Ord>(items: &[T]) -> bool {
        items.windows(2).all(|w| w[0] < w[1])
    }

    if ascending(from) && ascending(to) {
        let mut positions = SmallVec::with_capacity(from.len());
        let mut j = 0;
        for item in from {
            while j < to.len() && to[j] < *item {
                j += 1;
            }
            positions.push(if j < to.len() && to[j] == *item {
                Some(j)
            } else {
                None
            });
        }
        positions
    } else {
        from.iter()
            .map(|item| to.iter().position(|other| other == item))
            .collect()
    }
}
