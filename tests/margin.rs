use factor_tables::{EnumVariable, Factor, Factorize, Mixture, Registry, Variable, LOG_ZERO};
use float_cmp::approx_eq;

fn boolean(registry: &mut Registry, name: &str) -> EnumVariable {
    registry.enumerable(name, &["true", "false"]).unwrap()
}

#[test]
fn marginal_of_a_two_node_network() {
    let mut registry = Registry::new();
    let a = boolean(&mut registry, "A");
    let b = boolean(&mut registry, "B");

    let mut f1: Factor = Factor::new(&[a.clone()]).unwrap();
    f1.set_probability(&[0], 0.3).unwrap();
    f1.set_probability(&[1], 0.7).unwrap();

    let mut f2: Factor = Factor::new(&[a.clone(), b.clone()]).unwrap();
    f2.set_probability(&[0, 0], 0.9).unwrap();
    f2.set_probability(&[0, 1], 0.1).unwrap();
    f2.set_probability(&[1, 0], 0.2).unwrap();
    f2.set_probability(&[1, 1], 0.8).unwrap();

    let ops = Factorize::new();
    let p_b = ops.margin(&ops.product(&f1, &f2).unwrap(), &[a]).unwrap();
    assert_eq!(p_b.enum_vars(), &[b]);
    assert!(approx_eq!(f64, p_b.probability(&[0]).unwrap(), 0.41, epsilon = 1e-12));
    assert!(approx_eq!(f64, p_b.probability(&[1]).unwrap(), 0.59, epsilon = 1e-12));
}

#[test]
fn normalized_marginals_sum_to_one() {
    let mut registry = Registry::new();
    let vars: Vec<EnumVariable> = ["A", "B", "C"]
        .iter()
        .map(|name| registry.enumerable(name, &["0", "1", "2"]).unwrap())
        .collect();

    let mut x: Factor = Factor::new(&vars[..2]).unwrap();
    let mut y: Factor = Factor::new(&vars[1..]).unwrap();
    for index in 0..9 {
        x.set_value(index, -(index as f64) * 0.3).unwrap();
        y.set_value(index, -((9 - index) as f64) * 0.7).unwrap();
    }

    let ops = Factorize::new();
    let xy = ops.product(&x, &y).unwrap();
    for keep in vars.iter() {
        let others: Vec<EnumVariable> = vars.iter().filter(|v| *v != keep).cloned().collect();
        let marginal = ops.normal(&ops.margin(&xy, &others).unwrap()).unwrap();
        assert_eq!(marginal.enum_vars(), std::slice::from_ref(keep));
        assert!(approx_eq!(f64, marginal.sum(), 1.0, epsilon = 1e-9));
    }

    let everything = ops.margin(&xy, &vars).unwrap();
    assert!(everything.is_atomic());
    assert!(approx_eq!(f64, everything.atomic_value().unwrap(), xy.log_sum(), epsilon = 1e-12));
}

#[test]
fn normal_survives_underflow() {
    let mut registry = Registry::new();
    let a = registry.enumerable("A", &["0", "1", "2"]).unwrap();
    let mut f: Factor = Factor::new(&[a]).unwrap();
    f.set_value(0, -5000.0).unwrap();
    f.set_value(2, -5001.0).unwrap();
    assert_eq!(f.sum(), 0.0);

    let p = Factorize::new().normal(&f).unwrap();
    assert!(approx_eq!(f64, p.sum(), 1.0, epsilon = 1e-12));
    assert_eq!(p.value(1).unwrap(), LOG_ZERO);
    let e = std::f64::consts::E;
    assert!(approx_eq!(f64, p.probability(&[0]).unwrap(), e / (e + 1.0), epsilon = 1e-12));

    let zero: Factor = Factor::new(f.enum_vars()).unwrap();
    let still_zero = Factorize::new().normal(&zero).unwrap();
    assert!(still_zero.is_degenerate());
}

#[test]
fn margin_ignores_absent_variables() {
    let mut registry = Registry::new();
    let a = boolean(&mut registry, "A");
    let b = boolean(&mut registry, "B");
    let mut f: Factor = Factor::new(&[a.clone()]).unwrap();
    f.set_probability(&[0], 0.5).unwrap();

    let same = Factorize::new().margin(&f, &[b]).unwrap();
    assert_eq!(same.enum_vars(), &[a]);
    assert_eq!(same.value(0).unwrap(), f.value(0).unwrap());
    assert_eq!(same.value(1).unwrap(), LOG_ZERO);
}

#[test]
fn max_margin_traces_back_to_the_maximum() {
    let mut registry = Registry::new();
    let a = boolean(&mut registry, "A");
    let b = registry.enumerable("B", &["x", "y", "z"]).unwrap();
    let c = boolean(&mut registry, "C");

    let mut f: Factor = Factor::new(&[a.clone(), b.clone(), c.clone()]).unwrap();
    for index in 0..f.size() {
        let p = ((index * 5) % 12 + 1) as f64 / 13.0;
        f.set_value(index, p.ln()).unwrap();
    }

    let ops = Factorize::new();
    let best = ops.max_margin(&f, &[b.clone(), c.clone()]).unwrap();
    assert!(best.is_traced());
    assert_eq!(best.enum_vars(), &[a.clone()]);

    for index in 0..best.size() {
        let trace = best.trace(index).unwrap().unwrap();
        let key = [
            index,
            trace.get(&b).unwrap(),
            trace.get(&c).unwrap(),
        ];
        // Substituting the traced assignment back gives the maximum itself.
        assert_eq!(f.value_by_key(&key).unwrap(), best.value(index).unwrap());
        let expected = (0..f.size())
            .filter(|&i| f.get_key(i).unwrap()[0] == index)
            .map(|i| f.value(i).unwrap())
            .fold(LOG_ZERO, f64::max);
        assert_eq!(best.value(index).unwrap(), expected);
    }

    // Eliminating A next carries the earlier trace forward.
    let root = ops.max_margin(&best, &[a.clone()]).unwrap();
    let trace = root.atomic_trace().unwrap().unwrap();
    assert_eq!(trace.len(), 3);
    let key = [
        trace.get(&a).unwrap(),
        trace.get(&b).unwrap(),
        trace.get(&c).unwrap(),
    ];
    assert_eq!(f.value_by_key(&key).unwrap(), root.atomic_value().unwrap());
    let global_max = f.cells().map(|(_, v)| v).fold(LOG_ZERO, f64::max);
    assert_eq!(root.atomic_value().unwrap(), global_max);
}

#[test]
fn max_margin_breaks_ties_toward_lower_indices() {
    let mut registry = Registry::new();
    let a = boolean(&mut registry, "A");
    let b = registry.enumerable("B", &["x", "y", "z"]).unwrap();
    let mut f: Factor = Factor::sparse(&[a.clone(), b.clone()]).unwrap();
    for index in 0..6 {
        f.set_value(index, -1.0).unwrap();
    }
    let best = Factorize::new().max_margin(&f, &[b.clone()]).unwrap();
    assert_eq!(best.trace(0).unwrap().unwrap().get(&b), Some(0));
    assert_eq!(best.trace(1).unwrap().unwrap().get(&b), Some(0));
}

#[test]
fn margin_mixes_densities_by_posterior_mass() {
    let mut registry = Registry::new();
    let a = boolean(&mut registry, "A");
    let h = registry.continuous("height").unwrap();

    let mut f: Factor = Factor::new(vec![Variable::from(&a), Variable::from(&h)]).unwrap();
    f.set_probability(&[0], 0.25).unwrap();
    f.set_probability(&[1], 0.75).unwrap();
    f.set_density(0, &h, Mixture::normal(100.0, 5.0).unwrap())
        .unwrap();
    f.set_density(1, &h, Mixture::normal(200.0, 5.0).unwrap())
        .unwrap();

    let marginal = Factorize::new().margin(&f, &[a]).unwrap();
    assert!(marginal.is_atomic());
    assert!(approx_eq!(f64, marginal.sum(), 1.0, epsilon = 1e-12));
    let mixture = marginal.atomic_density(&h).unwrap().unwrap();
    assert_eq!(mixture.components(), 2);
    assert!(approx_eq!(f64, mixture.mean(), 175.0, epsilon = 1e-9));

    // Normalizing leaves densities alone.
    let normal = Factorize::new().normal(&f).unwrap();
    assert_eq!(normal.density(1, &h).unwrap().unwrap().mean(), 200.0);
}
