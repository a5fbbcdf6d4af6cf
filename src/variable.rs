use crate::error::{FactorError, Result};
use lasso::{Rodeo, Spur};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A random variable with a finite, ordered domain.
///
/// This is a cheap handle: cloning it only bumps a reference count. Two handles are equal exactly
/// when they have the same canonical index, and they sort by canonical index, which is what lets
/// every [`Factor`][crate::Factor] agree on one order for the variables it shares with any other
/// factor.
#[derive(Clone)]
pub struct EnumVariable(Arc<EnumInner>);

struct EnumInner {
    canonical: usize,
    name: Box<str>,
    domain: Box<[Box<str>]>,
}

impl EnumVariable {
    /// Creates a variable with the given canonical index, name, and domain.
    ///
    /// Most callers should use a [`Registry`] instead, which guarantees that canonical indexes are
    /// unique.
    ///
    /// The domain must be non-empty and must not repeat a token.
    ///
    /// ```
    /// use factor_tables::EnumVariable;
    ///
    /// let coin = EnumVariable::new(0, "coin", &["heads", "tails"]).unwrap();
    /// assert_eq!(coin.size(), 2);
    /// assert_eq!(coin.index_of("tails"), Some(1));
    /// assert_eq!(coin.value(0), Some("heads"));
    /// assert!(EnumVariable::new(1, "empty", &[]).is_err());
    /// ```
    pub fn new(canonical: usize, name: &str, domain: &[&str]) -> Result<Self> {
        if domain.is_empty() {
            return Err(FactorError::schema(format!(
                "variable {} has an empty domain",
                name
            )));
        }
        for (i, token) in domain.iter().enumerate() {
            if domain[..i].contains(token) {
                return Err(FactorError::schema(format!(
                    "variable {} repeats the value {}",
                    name, token
                )));
            }
        }
        Ok(EnumVariable(Arc::new(EnumInner {
            canonical,
            name: name.into(),
            domain: domain.iter().map(|&token| token.into()).collect(),
        })))
    }

    /// The variable's display name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The globally stable ordering key for this variable.
    pub fn canonical_index(&self) -> usize {
        self.0.canonical
    }

    /// The number of values in this variable's domain.
    pub fn size(&self) -> usize {
        self.0.domain.len()
    }

    /// Returns an iterator over the domain's value tokens, in domain order.
    pub fn domain(&self) -> impl ExactSizeIterator<Item = &str> + Clone + '_ {
        self.0.domain.iter().map(|token| &**token)
    }

    /// Finds the position of a value token in this variable's domain.
    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.0.domain.iter().position(|t| &**t == token)
    }

    /// Returns the value token at the given domain position.
    pub fn value(&self, index: usize) -> Option<&str> {
        self.0.domain.get(index).map(|token| &**token)
    }
}

impl PartialEq for EnumVariable {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical == other.0.canonical
    }
}

impl Eq for EnumVariable {}

impl Hash for EnumVariable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.canonical.hash(state)
    }
}

impl PartialOrd for EnumVariable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EnumVariable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.canonical.cmp(&other.0.canonical)
    }
}

impl fmt::Debug for EnumVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.canonical)
    }
}

impl fmt::Display for EnumVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// A variable with no finite domain, such as a continuous measurement. Its distribution, if any,
/// is carried by a [`Density`][crate::Density] attached to individual factor cells.
#[derive(Clone)]
pub struct ContinuousVariable(Arc<ContinuousInner>);

struct ContinuousInner {
    canonical: usize,
    name: Box<str>,
}

impl ContinuousVariable {
    /// Creates a continuous variable with the given canonical index and name.
    pub fn new(canonical: usize, name: &str) -> Self {
        ContinuousVariable(Arc::new(ContinuousInner {
            canonical,
            name: name.into(),
        }))
    }

    /// The variable's display name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The globally stable ordering key for this variable.
    pub fn canonical_index(&self) -> usize {
        self.0.canonical
    }
}

impl PartialEq for ContinuousVariable {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical == other.0.canonical
    }
}

impl Eq for ContinuousVariable {}

impl Hash for ContinuousVariable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.canonical.hash(state)
    }
}

impl PartialOrd for ContinuousVariable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContinuousVariable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.canonical.cmp(&other.0.canonical)
    }
}

impl fmt::Debug for ContinuousVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.canonical)
    }
}

impl fmt::Display for ContinuousVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Either kind of variable. Factors sort these out once, at construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Variable {
    /// A variable with a finite domain, which contributes to a factor's flat index.
    Enumerable(EnumVariable),
    /// A variable without a finite domain.
    Continuous(ContinuousVariable),
}

impl Variable {
    /// The variable's display name.
    pub fn name(&self) -> &str {
        match self {
            Variable::Enumerable(v) => v.name(),
            Variable::Continuous(v) => v.name(),
        }
    }

    /// The globally stable ordering key for this variable.
    pub fn canonical_index(&self) -> usize {
        match self {
            Variable::Enumerable(v) => v.canonical_index(),
            Variable::Continuous(v) => v.canonical_index(),
        }
    }
}

impl From<EnumVariable> for Variable {
    fn from(v: EnumVariable) -> Self {
        Variable::Enumerable(v)
    }
}

impl From<&EnumVariable> for Variable {
    fn from(v: &EnumVariable) -> Self {
        Variable::Enumerable(v.clone())
    }
}

impl From<ContinuousVariable> for Variable {
    fn from(v: ContinuousVariable) -> Self {
        Variable::Continuous(v)
    }
}

impl From<&ContinuousVariable> for Variable {
    fn from(v: &ContinuousVariable) -> Self {
        Variable::Continuous(v.clone())
    }
}

/// Hands out variables with unique canonical indexes.
///
/// Names are interned, and the interned key doubles as the canonical index, so variables are
/// ordered by when they were first registered.
///
/// ```
/// use factor_tables::{Registry, Variable};
///
/// let mut registry = Registry::new();
/// let a = registry.enumerable("A", &["t", "f"]).unwrap();
/// let x = registry.continuous("x").unwrap();
/// let b = registry.enumerable("B", &["t", "f"]).unwrap();
/// assert!(a < b);
/// assert_eq!(x.canonical_index(), 1);
///
/// // Asking again for the same variable returns the same handle.
/// assert_eq!(registry.enumerable("A", &["t", "f"]).unwrap(), a);
/// // But a conflicting definition is refused.
/// assert!(registry.enumerable("A", &["yes", "no"]).is_err());
/// assert!(registry.continuous("B").is_err());
///
/// assert_eq!(registry.get("x"), Some(&Variable::Continuous(x)));
/// ```
pub struct Registry {
    names: Rodeo<Spur>,
    canonical: HashMap<Spur, usize>,
    variables: Vec<Variable>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            names: Rodeo::new(),
            canonical: HashMap::new(),
            variables: Vec::new(),
        }
    }

    /// Returns the enumerable variable with this name, creating it if necessary.
    pub fn enumerable(&mut self, name: &str, domain: &[&str]) -> Result<EnumVariable> {
        if let Some(existing) = self.get(name) {
            return match existing {
                Variable::Enumerable(v) if v.domain().eq(domain.iter().copied()) => Ok(v.clone()),
                _ => Err(FactorError::schema(format!(
                    "variable {} is already registered differently",
                    name
                ))),
            };
        }
        let variable = EnumVariable::new(self.variables.len(), name, domain)?;
        self.register(name, variable.clone().into());
        Ok(variable)
    }

    /// Returns the continuous variable with this name, creating it if necessary.
    pub fn continuous(&mut self, name: &str) -> Result<ContinuousVariable> {
        if let Some(existing) = self.get(name) {
            return match existing {
                Variable::Continuous(v) => Ok(v.clone()),
                _ => Err(FactorError::schema(format!(
                    "variable {} is already registered as enumerable",
                    name
                ))),
            };
        }
        let variable = ContinuousVariable::new(self.variables.len(), name);
        self.register(name, variable.clone().into());
        Ok(variable)
    }

    fn register(&mut self, name: &str, variable: Variable) {
        let key = self.names.get_or_intern(name);
        self.canonical.insert(key, self.variables.len());
        self.variables.push(variable);
    }

    /// Looks up a previously registered variable by name.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.names
            .get(name)
            .and_then(|key| self.canonical.get(&key))
            .and_then(|&index| self.variables.get(index))
    }

    /// The number of registered variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Returns `true` if nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Returns an iterator over every registered variable in canonical order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Variable> + '_ {
        self.variables.iter()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_follows_registration_order() {
        let mut registry = Registry::new();
        let names = ["C", "x", "A", "y", "B"];
        for (i, name) in names.iter().enumerate() {
            if i % 2 == 0 {
                registry.enumerable(name, &["0", "1"]).unwrap();
            } else {
                registry.continuous(name).unwrap();
            }
        }
        assert_eq!(registry.len(), names.len());
        for (canonical, name) in names.iter().enumerate() {
            let variable = registry.get(name).unwrap();
            assert_eq!(variable.name(), *name);
            assert_eq!(variable.canonical_index(), canonical);
        }
        assert!(registry.get("D").is_none());

        let order: Vec<usize> = registry.iter().map(Variable::canonical_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn refused_redefinition_registers_nothing() {
        let mut registry = Registry::new();
        registry.enumerable("A", &["t", "f"]).unwrap();
        assert!(registry.continuous("A").is_err());
        let b = registry.continuous("b").unwrap();
        assert_eq!(b.canonical_index(), 1);
        assert_eq!(registry.get("b"), Some(&Variable::Continuous(b)));
    }
}
