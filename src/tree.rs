use crate::density::Density;
use crate::error::{FactorError, Result};
use crate::factor::Factor;
use crate::factorize::Factorize;
use crate::variable::EnumVariable;
use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByItemExt;
use sorted_iter::SortedIterator;
use std::borrow::Cow;

type Vars = SmallVec<[EnumVariable; 8]>;

#[derive(Clone, Debug)]
enum Node {
    Leaf(usize),
    Join { left: usize, right: usize, cost: usize },
}

#[derive(Clone, Debug)]
struct Entry {
    vars: Vars,
    node: Node,
}

/// An order in which to multiply a list of factors, as a binary tree.
///
/// Nodes live in one vector and refer to their children by position. The first nodes are the
/// leaves, one per input factor, in input order; every later node joins two earlier ones, so
/// evaluating nodes in order computes each pairwise product exactly once.
///
/// The tree is built greedily: at each step, the two pending nodes whose product has the lowest
/// estimated cost are joined. That's a local choice and can miss the globally cheapest order.
///
/// ```
/// use factor_tables::{EnumVariable, Factor, ProductTree};
///
/// let a = EnumVariable::new(0, "A", &["0", "1"]).unwrap();
/// let b = EnumVariable::new(1, "B", &["0", "1"]).unwrap();
/// let c = EnumVariable::new(2, "C", &["0", "1", "2", "3", "4", "5", "6", "7"]).unwrap();
///
/// let fa: Factor = Factor::new(&[a.clone()]).unwrap();
/// let fab: Factor = Factor::new(&[a, b.clone()]).unwrap();
/// let fc: Factor = Factor::new(&[c]).unwrap();
///
/// let tree = ProductTree::build(&[&fc, &fa, &fab], false);
/// assert_eq!(tree.len(), 5);
/// // A and A*B are cheapest to join first, then C joins the result.
/// assert_eq!(tree.pairs().collect::<Vec<_>>(), vec![(1, 2), (0, 3)]);
/// assert_eq!(tree.root(), Some(4));
/// assert_eq!(tree.cost(), 4 + 32);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ProductTree {
    nodes: Vec<Entry>,
}

impl ProductTree {
    /// Plans the product of `factors`.
    ///
    /// The cost of joining two nodes is the number of cells in their product. If
    /// `count_shared_twice` is set, each variable the two nodes share multiplies the cost by its
    /// domain size once more, which steers the plan toward joining unrelated factors later.
    pub fn build<D: Density>(factors: &[&Factor<D>], count_shared_twice: bool) -> Self {
        let mut nodes: Vec<Entry> = factors
            .iter()
            .enumerate()
            .map(|(i, factor)| Entry {
                vars: factor.enum_vars().iter().cloned().collect(),
                node: Node::Leaf(i),
            })
            .collect();
        let mut pending: Vec<usize> = (0..nodes.len()).collect();

        while pending.len() > 1 {
            let mut best: Option<(usize, usize, usize)> = None;
            for i in 0..pending.len() {
                for j in i + 1..pending.len() {
                    let cost = join_cost(
                        &nodes[pending[i]].vars,
                        &nodes[pending[j]].vars,
                        count_shared_twice,
                    );
                    if best.map_or(true, |(lowest, _, _)| cost < lowest) {
                        best = Some((cost, i, j));
                    }
                }
            }
            let (cost, i, j) = match best {
                Some(best) => best,
                None => break,
            };

            let right = pending.remove(j);
            let left = pending.remove(i);
            let vars = union(&nodes[left].vars, &nodes[right].vars);
            pending.push(nodes.len());
            nodes.push(Entry {
                vars,
                node: Node::Join { left, right, cost },
            });
        }

        let tree = ProductTree { nodes };
        tracing::debug!(
            factors = factors.len(),
            joins = tree.nodes.len().saturating_sub(factors.len()),
            cost = tree.cost(),
            "planned product"
        );
        tree
    }

    /// The number of nodes, counting leaves.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the tree was built from no factors.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node holding the complete product, or `None` for an empty tree.
    pub fn root(&self) -> Option<usize> {
        self.nodes.len().checked_sub(1)
    }

    /// The total estimated cost of every join in the tree.
    pub fn cost(&self) -> usize {
        self.nodes
            .iter()
            .map(|entry| match entry.node {
                Node::Leaf(_) => 0,
                Node::Join { cost, .. } => cost,
            })
            .fold(0, usize::saturating_add)
    }

    /// The children of every join, in the order the joins are evaluated. Leaf `i` is node `i`.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.nodes.iter().filter_map(|entry| match entry.node {
            Node::Leaf(_) => None,
            Node::Join { left, right, .. } => Some((left, right)),
        })
    }

    /// The enumerable variables of the product computed at `node`.
    pub fn variables(&self, node: usize) -> Option<&[EnumVariable]> {
        self.nodes.get(node).map(|entry| &entry.vars[..])
    }

    /// Multiplies `factors`, which must be the same list this tree was built from, in the
    /// planned order.
    pub fn evaluate<D: Density>(
        &self,
        factorize: &Factorize,
        factors: &[&Factor<D>],
    ) -> Result<Factor<D>> {
        let leaves = self
            .nodes
            .iter()
            .filter(|entry| matches!(entry.node, Node::Leaf(_)))
            .count();
        if leaves != factors.len() {
            return Err(FactorError::schema(format!(
                "product tree was planned for {} factors but given {}",
                leaves,
                factors.len()
            )));
        }

        let mut results: Vec<Option<Factor<D>>> = Vec::with_capacity(self.nodes.len());
        results.resize_with(self.nodes.len(), || None);
        for (id, entry) in self.nodes.iter().enumerate() {
            if let Node::Join { left, right, .. } = entry.node {
                let x = self.operand(&mut results, factors, left)?;
                let y = self.operand(&mut results, factors, right)?;
                results[id] = Some(factorize.product(&x, &y)?);
            }
        }

        match self.root() {
            None => Ok(Factor::atomic(0.0)),
            Some(root) => Ok(self.operand(&mut results, factors, root)?.into_owned()),
        }
    }

    fn operand<'a, D: Density>(
        &self,
        results: &mut [Option<Factor<D>>],
        factors: &[&'a Factor<D>],
        node: usize,
    ) -> Result<Cow<'a, Factor<D>>> {
        match self.nodes[node].node {
            Node::Leaf(i) => Ok(Cow::Borrowed(factors[i])),
            // Every join feeds exactly one parent, so its result can be moved out.
            Node::Join { .. } => results[node]
                .take()
                .map(Cow::Owned)
                .ok_or_else(|| FactorError::schema(format!("product tree node {} reused", node))),
        }
    }
}

fn union(a: &[EnumVariable], b: &[EnumVariable]) -> Vars {
    a.iter()
        .cloned()
        .assume_sorted_by_item()
        .union(b.iter().cloned().assume_sorted_by_item())
        .collect()
}

fn join_cost(a: &[EnumVariable], b: &[EnumVariable], count_shared_twice: bool) -> usize {
    let cells = a
        .iter()
        .assume_sorted_by_item()
        .union(b.iter().assume_sorted_by_item())
        .fold(1usize, |cost, v| cost.saturating_mul(v.size()));
    if count_shared_twice {
        a.iter()
            .assume_sorted_by_item()
            .intersection(b.iter().assume_sorted_by_item())
            .fold(cells, |cost, v| cost.saturating_mul(v.size()))
    } else {
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mixture;

    fn var(canonical: usize, size: usize) -> EnumVariable {
        let names: Vec<String> = (0..size).map(|i| i.to_string()).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        EnumVariable::new(canonical, &format!("V{}", canonical), &names).unwrap()
    }

    #[test]
    fn shared_variables_can_count_twice() {
        let (a, b) = (var(0, 3), var(1, 2));
        assert_eq!(join_cost(&[a.clone(), b.clone()], &[a.clone()], false), 6);
        assert_eq!(join_cost(&[a.clone(), b.clone()], &[a.clone()], true), 18);
        assert_eq!(join_cost(&[], &[], true), 1);
    }

    #[test]
    fn trivial_trees() {
        let empty = ProductTree::build::<Mixture>(&[], false);
        assert!(empty.is_empty());
        assert_eq!(empty.root(), None);
        let one = empty.evaluate::<Mixture>(&Factorize::new(), &[]).unwrap();
        assert_eq!(one.atomic_value().unwrap(), 0.0);

        let mut f: Factor<Mixture> = Factor::new(&[var(0, 2)]).unwrap();
        f.set_value(1, -2.0).unwrap();
        let single = ProductTree::build(&[&f], false);
        assert_eq!(single.len(), 1);
        assert_eq!(single.pairs().count(), 0);
        let copy = single.evaluate(&Factorize::new(), &[&f]).unwrap();
        assert_eq!(copy.value(1).unwrap(), -2.0);

        assert!(single.evaluate(&Factorize::new(), &[&f, &f]).is_err());
    }
}
