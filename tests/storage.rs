use factor_tables::{
    EnumVariable, Factor, FactorCache, FactorError, Factorize, Registry, StorageKind, LOG_ZERO,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

fn variables() -> Vec<EnumVariable> {
    let mut registry = Registry::new();
    vec![
        registry.enumerable("A", &["0", "1"]).unwrap(),
        registry.enumerable("B", &["0", "1", "2"]).unwrap(),
        registry.enumerable("C", &["0", "1", "2", "3"]).unwrap(),
    ]
}

proptest! {
    #[test]
    fn sparse_and_dense_agree(writes in prop::collection::vec((0usize..24, prop::option::of(-10.0f64..0.0)), 0..64)) {
        let vars = variables();
        let mut dense: Factor = Factor::with_storage(&vars, StorageKind::Dense).unwrap();
        let mut sparse: Factor = Factor::with_storage(&vars, StorageKind::Sparse).unwrap();
        for (index, value) in writes {
            let value = value.unwrap_or(LOG_ZERO);
            dense.set_value(index, value).unwrap();
            sparse.set_value(index, value).unwrap();
        }
        prop_assert_eq!(dense.occupied(), sparse.occupied());
        for index in 0..dense.size() {
            prop_assert_eq!(dense.value(index).unwrap(), sparse.value(index).unwrap());
        }
        prop_assert_eq!(FactorCache::fingerprint(&dense), FactorCache::fingerprint(&sparse));
    }
}

#[test]
fn shared_factors_are_read_only() {
    let vars = variables();
    let mut f: Factor = Factor::new(&vars[..1]).unwrap();
    f.set_value(0, -0.5).unwrap();

    let cache = FactorCache::new();
    let mut shared = f.share(&cache);
    assert_eq!(shared.storage().name(), "cached");
    assert_eq!(shared.value(0).unwrap(), -0.5);
    assert_eq!(shared.occupied(), 1);
    assert!(matches!(
        shared.set_value(1, 0.0),
        Err(FactorError::Unsupported {
            storage: "cached",
            ..
        })
    ));
    assert!(shared.clone().with_tracing().add_trace(0, &vars[0], 1).is_err());

    // Operations on cached inputs produce ordinary writable factors.
    let normal = Factorize::new().normal(&shared).unwrap();
    assert_eq!(normal.storage().name(), "dense");
    assert_eq!(normal.value(0).unwrap(), 0.0);
}

#[test]
fn identical_results_share_one_block() {
    let vars = variables();
    let cache = Arc::new(FactorCache::new());
    let ops = Factorize::new().with_cache(cache.clone());

    let mut x: Factor = Factor::new(&vars[..2]).unwrap();
    let mut y: Factor = Factor::new(&vars[1..]).unwrap();
    for index in 0..6 {
        x.set_value(index, -(index as f64)).unwrap();
    }
    for index in 0..12 {
        y.set_value(index, -0.5).unwrap();
    }

    let first = ops.product(&x, &y).unwrap();
    let second = ops.product(&x, &y).unwrap();
    assert_eq!(cache.len(), 1);
    let (a, b) = (first.storage().block().unwrap(), second.storage().block().unwrap());
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(cache.hits(FactorCache::fingerprint(&first)), Some(1));

    // Traced results keep their own storage.
    let best = ops.max_margin(&first, &vars[..1]).unwrap();
    assert!(best.storage().block().is_none());
    assert_eq!(cache.len(), 1);

    // Margins are interned too, and remain usable as inputs.
    let summed = ops.margin(&first, &vars[2..]).unwrap();
    assert_eq!(summed.storage().name(), "cached");
    assert_eq!(cache.len(), 2);
    let again = ops.product(&summed, &x).unwrap();
    assert_eq!(again.size(), 6);
}

#[test]
fn max_margin_over_nothing_copies_cached_cells() {
    let vars = variables();
    let mut f: Factor = Factor::new(&vars[..2]).unwrap();
    for index in 0..f.size() {
        f.set_value(index, -(index as f64) - 0.25).unwrap();
    }
    let shared = f.share(&FactorCache::new());
    assert_eq!(shared.storage().name(), "cached");

    let ops = Factorize::new();
    let mut best = ops.max_margin(&shared, &vars[2..]).unwrap();
    assert!(best.is_traced());
    assert!(best.storage().block().is_none());
    assert_eq!(best.occupied(), shared.occupied());
    for index in 0..shared.size() {
        assert_eq!(best.value(index).unwrap(), shared.value(index).unwrap());
    }
    best.add_trace(0, &vars[2], 3).unwrap();
    assert_eq!(best.trace(0).unwrap().unwrap().get(&vars[2]), Some(3));

    let zero: Factor = Factor::new(&vars[..1]).unwrap().share(&FactorCache::new());
    let mut normal = ops.normal(&zero).unwrap();
    assert!(normal.is_degenerate());
    normal.set_value(1, 0.0).unwrap();
}

#[test]
fn cache_tolerates_concurrent_jobs() {
    let vars = variables();
    let cache = Arc::new(FactorCache::new());
    let handles: Vec<_> = (0..8usize)
        .map(|job| {
            let cache = cache.clone();
            let vars = vars.clone();
            thread::spawn(move || {
                let ops = Factorize::new().with_cache(cache);
                let mut f: Factor = Factor::new(&vars).unwrap();
                // Every other job builds the same table.
                for index in 0..f.size() {
                    f.set_value(index, -((index % (job % 2 + 2)) as f64)).unwrap();
                }
                let reduced = ops.margin(&f, &vars[..1]).unwrap();
                reduced.value(0).unwrap()
            })
        })
        .collect();
    let values: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(cache.len(), 2);
    assert!(values.iter().step_by(2).all(|&v| v == values[0]));
    assert!(values.iter().skip(1).step_by(2).all(|&v| v == values[1]));
}

#[test]
fn diagnostic_dump_lists_occupied_cells() {
    let vars = variables();
    let mut f: Factor = Factor::sparse(&vars[..2]).unwrap();
    f.set_probability(&[1, 2], 0.5).unwrap();
    f.set_probability(&[0, 1], 0.25).unwrap();
    let dump = f.to_string();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines[0], "factor(A, B) sparse storage, 2 of 6 cells occupied");
    assert_eq!(lines[1], "A\tB\tlog\tp");
    assert!(lines[2].starts_with("0\t1\t"));
    assert!(lines[3].starts_with("1\t2\t"));
    assert!(lines[3].ends_with("0.500000"));
    assert_eq!(lines.len(), 4);
}
