use crate::error::{FactorError, Result};
use crate::variable::ContinuousVariable;
use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByKeyExt;
use sorted_iter::SortedPairIterator;
use statrs::distribution::{Continuous, Normal};
use std::fmt;

/// A distribution over one continuous variable, attached to a factor cell.
///
/// Factors never look inside a density. The only thing sum-marginalization needs is a way to fold
/// the densities of several cells into one weighted mixture.
pub trait Density: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Returns the mixture of `self` and `other`, weighted by `weight` and `other_weight`
    /// respectively. The weights need not sum to one.
    fn mix(&self, weight: f64, other: &Self, other_weight: f64) -> Self;
}

/// A joint density attachment: one [`Density`] per continuous variable, conditioned on the
/// enumerable-variable instantiation of the cell it is attached to.
#[derive(Clone, Debug)]
pub struct Jdf<D>(SmallVec<[(ContinuousVariable, D); 2]>);

impl<D: Density> Jdf<D> {
    /// Creates an empty attachment.
    pub fn new() -> Self {
        Jdf(SmallVec::new())
    }

    /// Creates an attachment with a single variable.
    pub fn single(variable: ContinuousVariable, density: D) -> Self {
        let mut jdf = Jdf::new();
        jdf.insert(variable, density);
        jdf
    }

    /// Attaches `density` to `variable`, returning whatever was attached there before.
    pub fn insert(&mut self, variable: ContinuousVariable, density: D) -> Option<D> {
        match self.0.binary_search_by(|(v, _)| v.cmp(&variable)) {
            Ok(at) => Some(std::mem::replace(&mut self.0[at].1, density)),
            Err(at) => {
                self.0.insert(at, (variable, density));
                None
            }
        }
    }

    /// Returns the density attached to `variable`, if there is one.
    pub fn get(&self, variable: &ContinuousVariable) -> Option<&D> {
        self.0
            .binary_search_by(|(v, _)| v.cmp(variable))
            .ok()
            .map(|at| &self.0[at].1)
    }

    /// The number of variables with an attached density.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no density is attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the attached densities, ordered by variable.
    pub fn iter(&self) -> impl Iterator<Item = (&ContinuousVariable, &D)> + '_ {
        self.0.iter().map(|(v, d)| (v, d))
    }

    /// Joins two attachments over disjoint sets of variables.
    ///
    /// Two densities over the same variable can't be combined this way, so any overlap is
    /// a schema error.
    pub fn combine(&self, other: &Self) -> Result<Self> {
        let mut combined = SmallVec::with_capacity(self.len() + other.len());
        for (variable, (mine, theirs)) in self
            .iter()
            .assume_sorted_by_key()
            .outer_join(other.iter().assume_sorted_by_key())
        {
            let density = match (mine, theirs) {
                (Some(_), Some(_)) => {
                    return Err(FactorError::schema(format!(
                        "both densities describe {}",
                        variable
                    )))
                }
                (Some(d), None) | (None, Some(d)) => d,
                (None, None) => unreachable!(),
            };
            combined.push((variable.clone(), density.clone()));
        }
        Ok(Jdf(combined))
    }

    /// Mixes two attachments variable by variable. A variable present on only one side keeps that
    /// side's density.
    pub fn mix(&self, weight: f64, other: &Self, other_weight: f64) -> Self {
        let mut mixed = SmallVec::with_capacity(self.len().max(other.len()));
        for (variable, (mine, theirs)) in self
            .iter()
            .assume_sorted_by_key()
            .outer_join(other.iter().assume_sorted_by_key())
        {
            let density = match (mine, theirs) {
                (Some(a), Some(b)) => a.mix(weight, b, other_weight),
                (Some(d), None) | (None, Some(d)) => d.clone(),
                (None, None) => unreachable!(),
            };
            mixed.push((variable.clone(), density));
        }
        Jdf(mixed)
    }
}

impl<D: Density> Default for Jdf<D> {
    fn default() -> Self {
        Jdf::new()
    }
}

impl<D: Density> fmt::Display for Jdf<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter();
        if let Some((variable, density)) = iter.next() {
            write!(f, "{}~{}", variable, density)?;
        }
        for (variable, density) in iter {
            write!(f, ", {}~{}", variable, density)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Component {
    weight: f64,
    mean: f64,
    std_dev: f64,
    normal: Normal,
}

/// A weighted mixture of normal distributions.
///
/// This is the [`Density`] that [`Factor`][crate::Factor] uses unless told otherwise. Mixing two
/// mixtures concatenates their components, merging components with identical parameters.
///
/// ```
/// use factor_tables::{Density, Mixture};
///
/// let low = Mixture::normal(0.0, 1.0).unwrap();
/// let high = Mixture::normal(10.0, 1.0).unwrap();
///
/// let both = low.mix(3.0, &high, 1.0);
/// assert_eq!(both.components(), 2);
/// assert!((both.mean() - 2.5).abs() < 1e-12);
///
/// // Mixing a density with itself doesn't grow it.
/// assert_eq!(low.mix(0.5, &low, 0.5).components(), 1);
///
/// assert!(Mixture::normal(0.0, 0.0).is_err());
/// ```
#[derive(Clone, Debug)]
pub struct Mixture {
    components: SmallVec<[Component; 2]>,
}

impl Mixture {
    /// Creates a single normal distribution.
    pub fn normal(mean: f64, std_dev: f64) -> Result<Self> {
        let normal = Normal::new(mean, std_dev)
            .map_err(|e| FactorError::Density(format!("N({}, {}): {}", mean, std_dev, e)))?;
        let mut components = SmallVec::new();
        components.push(Component {
            weight: 1.0,
            mean,
            std_dev,
            normal,
        });
        Ok(Mixture { components })
    }

    /// The number of normal components in this mixture.
    pub fn components(&self) -> usize {
        self.components.len()
    }

    /// Evaluates the probability density function at `x`.
    pub fn pdf(&self, x: f64) -> f64 {
        self.components
            .iter()
            .map(|c| c.weight * c.normal.pdf(x))
            .sum()
    }

    /// The mean of the mixture.
    pub fn mean(&self) -> f64 {
        self.components.iter().map(|c| c.weight * c.mean).sum()
    }

    fn push_scaled(&mut self, component: &Component, scale: f64) {
        let weight = component.weight * scale;
        if let Some(existing) = self
            .components
            .iter_mut()
            .find(|c| c.mean == component.mean && c.std_dev == component.std_dev)
        {
            existing.weight += weight;
        } else {
            self.components.push(Component {
                weight,
                ..*component
            });
        }
    }
}

impl Density for Mixture {
    fn mix(&self, weight: f64, other: &Self, other_weight: f64) -> Self {
        let total = weight + other_weight;
        if !(total > 0.0) || !total.is_finite() {
            return self.clone();
        }
        let mut mixed = Mixture {
            components: SmallVec::with_capacity(self.components.len() + other.components.len()),
        };
        for component in self.components.iter() {
            mixed.push_scaled(component, weight / total);
        }
        for component in other.components.iter() {
            mixed.push_scaled(component, other_weight / total);
        }
        mixed
    }
}

impl fmt::Display for Mixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = &self.components[..] {
            return write!(f, "N({:.3}, {:.3})", only.mean, only.std_dev);
        }
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(" + ")?;
            }
            write!(f, "{:.3}*N({:.3}, {:.3})", c.weight, c.mean, c.std_dev)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_rejects_overlap() {
        let x = ContinuousVariable::new(0, "x");
        let y = ContinuousVariable::new(1, "y");
        let nx = Jdf::single(x.clone(), Mixture::normal(0.0, 1.0).unwrap());
        let ny = Jdf::single(y.clone(), Mixture::normal(1.0, 2.0).unwrap());

        let both = nx.combine(&ny).unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both.get(&y).unwrap().mean(), 1.0);
        assert!(both.combine(&nx).is_err());
    }

    #[test]
    fn mix_keeps_one_sided_variables() {
        let x = ContinuousVariable::new(0, "x");
        let y = ContinuousVariable::new(1, "y");
        let mut a = Jdf::single(x.clone(), Mixture::normal(0.0, 1.0).unwrap());
        a.insert(y.clone(), Mixture::normal(5.0, 1.0).unwrap());
        let b = Jdf::single(x.clone(), Mixture::normal(4.0, 1.0).unwrap());

        let mixed = a.mix(1.0, &b, 1.0);
        assert_eq!(mixed.get(&x).unwrap().components(), 2);
        assert_eq!(mixed.get(&x).unwrap().mean(), 2.0);
        assert_eq!(mixed.get(&y).unwrap().components(), 1);
        assert_eq!(mixed.to_string(), "x~0.500*N(0.000, 1.000) + 0.500*N(4.000, 1.000), y~N(5.000, 1.000)");
    }
}
