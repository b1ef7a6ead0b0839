use nbs::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

struct TestSubject {
    id: u32,
    series: HashMap<String, Vec<f64>>,
}

impl Subject for TestSubject {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }

    fn series(&self, label: &str) -> Option<&[f64]> {
        self.series.get(label).map(|values| &values[..])
    }
}

fn subject(id: u32, series: Vec<(&str, Vec<f64>)>) -> TestSubject {
    TestSubject {
        id,
        series: series
            .into_iter()
            .map(|(label, values)| (label.to_owned(), values))
            .collect(),
    }
}

/// A flattened symmetric matrix with every cell 1.0 except the listed `hot` edges, which are set
/// (in both triangles) to `hot_value`.
fn constant_matrix(n: usize, hot: &[(usize, usize)], hot_value: f64) -> Vec<f64> {
    let mut matrix = vec![1.0; n * n];
    for &(i, j) in hot {
        matrix[i * n + j] = hot_value;
        matrix[j * n + i] = hot_value;
    }
    matrix
}

/// A graph whose only edges form a line 0-1-2-...-k, giving a single component of `k` edges.
fn line_graph(spec: &DataSeriesSpec, edges: usize) -> Graph {
    let n = spec.node_count;
    assert!(edges < n);
    let mut t = vec![0.0; n * n];
    for i in 0..edges {
        t[i * n + i + 1] = 9.0;
    }
    Graph::from_t_stats(&t, spec)
}

fn edge_graph(spec: &DataSeriesSpec, edges: &[(usize, usize)]) -> Graph {
    let n = spec.node_count;
    let mut t = vec![0.0; n * n];
    for &(i, j) in edges {
        t[i * n + j] = 9.0;
    }
    Graph::from_t_stats(&t, spec)
}

#[test]
fn sub_threshold_matrix_has_no_components() {
    for &threshold in &[0.0, 1.0, 5.0] {
        let spec = DataSeriesSpec::new("alpha", threshold, 3);
        // Entries equal to the threshold must not become edges: selection is strictly greater.
        for &fill in &[threshold, -threshold, threshold / 2.0] {
            let graph = Graph::from_t_stats(&vec![fill; 9], &spec);
            assert_eq!(graph.component_count(), 0);
            assert_eq!(graph.largest_component_size(), 0);
            assert!(graph.largest_component().is_none());
        }
    }
}

#[test]
fn symmetric_cells_collapse_to_one_edge() {
    let spec = DataSeriesSpec::new("alpha", 1.0, 3);
    let t = [
        0.0, 2.0, 0.0, //
        -2.0, 0.0, 0.0, //
        0.0, 0.0, 0.0,
    ];
    let graph = Graph::from_t_stats(&t, &spec);
    assert_eq!(graph.component_count(), 1);
    let component = graph.largest_component().unwrap();
    assert_eq!(component.edges(), &[(0, 1)]);
    assert_eq!(component.size(), 1);
    assert_eq!(component.node_count(), 2);
}

#[test]
fn largest_component_ties_keep_first() {
    let spec = DataSeriesSpec::new("alpha", 1.0, 6);
    // Two disjoint single-edge components; (0,1) sorts ahead of (3,4) so it is found first.
    let graph = edge_graph(&spec, &[(3, 4), (0, 1)]);
    assert_eq!(graph.component_count(), 2);
    let largest = graph.largest_component().unwrap();
    assert_eq!(largest.edges(), &[(0, 1)]);
}

#[test]
fn two_series_scenario_matches_expected_components_and_overlap() {
    let specs = [
        DataSeriesSpec::new("A", 1.0, 3),
        DataSeriesSpec::new("B", 1.0, 3),
    ];

    let build = |id: u32, hot_value: f64| {
        subject(
            id,
            vec![
                ("A", constant_matrix(3, &[(0, 1)], hot_value)),
                ("B", constant_matrix(3, &[(0, 1), (1, 2)], hot_value)),
            ],
        )
    };
    let group1: Vec<TestSubject> = (0..5).map(|id| build(id, 1.0)).collect();
    let group2: Vec<TestSubject> = (5..10).map(|id| build(id, 2.0)).collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let cache = SeriesCache::build(&group1, &group2, &specs).unwrap();
    let ids1: Vec<u32> = (0..5).collect();
    let ids2: Vec<u32> = (5..10).collect();
    let result = cache.compare_groups(&ids1, &ids2);

    let a = result.graph("A").unwrap().largest_component().unwrap();
    assert_eq!(a.nodes().iter().collect::<Vec<u32>>(), vec![0, 1]);
    assert_eq!(a.size(), 1);

    let b = result.graph("B").unwrap().largest_component().unwrap();
    assert_eq!(b.nodes().iter().collect::<Vec<u32>>(), vec![0, 1, 2]);
    assert_eq!(b.size(), 2);

    assert_eq!(result.node_overlap(), vec![0, 1]);
}

#[test]
fn swapping_groups_preserves_components() {
    let spec = [DataSeriesSpec::new("A", 3.0, 3)];

    // The hot edge varies within each group so the statistic is finite; everything else has
    // zero variance in both groups and tests to t = 0.
    let build = |id: u32, base: f64| {
        subject(
            id,
            vec![(
                "A",
                constant_matrix(3, &[(0, 1)], base + f64::from(id % 5) * 0.1),
            )],
        )
    };
    let group1: Vec<TestSubject> = (0..5).map(|id| build(id, 1.0)).collect();
    let group2: Vec<TestSubject> = (5..10).map(|id| build(id, 3.0)).collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let cache = SeriesCache::build(&group1, &group2, &spec).unwrap();
    let ids1: Vec<u32> = (0..5).collect();
    let ids2: Vec<u32> = (5..10).collect();

    let forward = cache.compare_groups(&ids1, &ids2);
    let reversed = cache.compare_groups(&ids2, &ids1);

    let forward = forward.graph("A").unwrap();
    let reversed = reversed.graph("A").unwrap();
    assert_eq!(forward.component_count(), reversed.component_count());
    assert_eq!(
        forward.largest_component_size(),
        reversed.largest_component_size()
    );
    for (f, r) in forward.components().iter().zip(reversed.components()) {
        assert_eq!(f.edges(), r.edges());
        assert_eq!(f.nodes(), r.nodes());
    }

    // The t statistics themselves only flip sign.
    let forward_t = cache.t_test(0, &ids1, &ids2);
    let reversed_t = cache.t_test(0, &ids2, &ids1);
    for (f, r) in forward_t.t_stats.iter().zip(reversed_t.t_stats.iter()) {
        assert!((f + r).abs() < 1e-12);
    }
}

#[test]
fn t_test_matches_reference_values() {
    let spec = [DataSeriesSpec::new("m", 0.0, 1)];
    let group1: Vec<TestSubject> = (0..5)
        .map(|id| subject(id, vec![("m", vec![f64::from(id) + 1.0])]))
        .collect();
    let group2: Vec<TestSubject> = (5..10)
        .map(|id| subject(id, vec![("m", vec![f64::from(id) - 3.0])]))
        .collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let cache = SeriesCache::build(&group1, &group2, &spec).unwrap();
    let ids1: Vec<u32> = (0..5).collect();
    let ids2: Vec<u32> = (5..10).collect();

    // group1 is [1,2,3,4,5], group2 is [2,3,4,5,6]: t = -1.0 with 8 degrees of freedom,
    // two-sided p = 0.34659 (reference value from scipy.stats.ttest_ind).
    let tested = cache.t_test(0, &ids1, &ids2);
    assert!((tested.t_stats[0] + 1.0).abs() < 1e-12);
    assert!((tested.p_values[0] - 0.34659350708733416).abs() < 1e-7);
}

#[test]
fn zero_variance_features_resolve_to_defined_statistic() {
    let spec = [DataSeriesSpec::new("m", 0.5, 2)];
    let build = |id: u32| subject(id, vec![("m", vec![3.0, 1.0, 1.0, 3.0])]);
    let group1: Vec<TestSubject> = (0..3).map(build).collect();
    let group2: Vec<TestSubject> = (3..6).map(build).collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let cache = SeriesCache::build(&group1, &group2, &spec).unwrap();
    let tested = cache.t_test(0, &[0, 1, 2], &[3, 4, 5]);
    for feature in 0..4 {
        assert_eq!(tested.t_stats[feature], 0.0);
        assert_eq!(tested.p_values[feature], 1.0);
    }

    // Identical data in both groups must never produce edges, at any threshold.
    let result = cache.compare_groups(&[0, 1, 2], &[3, 4, 5]);
    assert_eq!(result.graph("m").unwrap().component_count(), 0);
}

#[test]
fn null_distribution_records_every_iteration() {
    let specs = [
        DataSeriesSpec::new("A", 1.0, 3),
        DataSeriesSpec::new("B", 1.0, 3),
    ];
    let build = |id: u32, hot_value: f64| {
        subject(
            id,
            vec![
                ("A", constant_matrix(3, &[(0, 1)], hot_value)),
                ("B", constant_matrix(3, &[(1, 2)], hot_value)),
            ],
        )
    };
    let group1: Vec<TestSubject> = (0..4).map(|id| build(id, 1.0)).collect();
    let group2: Vec<TestSubject> = (4..8).map(|id| build(id, 2.0)).collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let mut rng = StdRng::seed_from_u64(42);
    let result = compare(&group1, &group2, &specs, 25, &mut rng).unwrap();

    let null = result.null_distribution();
    assert_eq!(null.iterations(), 25);
    assert_eq!(null.series_sizes("A").unwrap().len(), 25);
    assert_eq!(null.series_sizes("B").unwrap().len(), 25);
    assert_eq!(null.overlap_histogram().iter().sum::<usize>(), 25);

    // Every component of the actual result is annotated with an empirical p-value.
    for (_, graph) in result.actual().iter() {
        for component in graph.components() {
            let p = component.p_value().unwrap();
            assert!((0.0..=1.0).contains(&p));
        }
    }
}

#[test]
fn component_p_value_is_the_strict_tail_fraction() {
    let spec = DataSeriesSpec::new("alpha", 1.0, 8);
    let mut null = NullDistribution::new(&[spec.clone()], 100);
    for i in 0..100 {
        let mut result = MultiSeriesResult::new();
        result.push("alpha", line_graph(&spec, if i < 3 { 5 } else { 2 }));
        null.record(&result);
    }

    // Exactly 3 of 100 permutations exceeded a component of 4 edges.
    assert_eq!(null.component_p_value("alpha", 4), 0.03);
    assert_eq!(null.component_p_value("alpha", 2), 0.03);
    assert_eq!(null.component_p_value("alpha", 1), 1.0);

    // Nothing exceeded the maximum recorded size: exactly zero, not 1/100.
    assert_eq!(null.component_p_value("alpha", 5), 0.0);
}

#[test]
fn component_p_value_is_non_increasing_in_observed_size() {
    let spec = DataSeriesSpec::new("alpha", 1.0, 8);
    let mut null = NullDistribution::new(&[spec.clone()], 60);
    for i in 0..60usize {
        let mut result = MultiSeriesResult::new();
        result.push("alpha", line_graph(&spec, i % 7));
        null.record(&result);
    }

    for size in 0..8 {
        assert!(
            null.component_p_value("alpha", size) >= null.component_p_value("alpha", size + 1)
        );
    }
}

#[test]
fn single_series_overlap_is_empty() {
    let spec = DataSeriesSpec::new("alpha", 1.0, 4);
    let mut result = MultiSeriesResult::new();
    result.push("alpha", line_graph(&spec, 2));
    assert!(result.node_overlap().is_empty());

    let mut null = NullDistribution::new(&[spec.clone()], 50);
    for _ in 0..50 {
        let mut result = MultiSeriesResult::new();
        result.push("alpha", line_graph(&spec, 2));
        null.record(&result);
    }
    assert_eq!(null.max_overlap_count(), 0);
    // A node that never appeared in any permutation's overlap sequence.
    assert_eq!(null.overlap_node_p_value(3), (0, 50, 0.0));
}

#[test]
fn overlap_keeps_duplicates_across_three_series() {
    let spec = DataSeriesSpec::new("s", 1.0, 6);
    let mut result = MultiSeriesResult::new();
    result.push("base", edge_graph(&spec, &[(0, 1), (1, 2)]));
    result.push("second", edge_graph(&spec, &[(0, 1)]));
    result.push("third", edge_graph(&spec, &[(1, 2)]));

    // Node 1 qualifies once through each subsequent series, so it appears twice; this is not a
    // three-way intersection.
    assert_eq!(result.node_overlap(), vec![0, 1, 1, 2]);

    let specs = [
        DataSeriesSpec::new("base", 1.0, 6),
        DataSeriesSpec::new("second", 1.0, 6),
        DataSeriesSpec::new("third", 1.0, 6),
    ];
    let mut null = NullDistribution::new(&specs, 1);
    null.record(&result);
    assert_eq!(null.max_overlap_count(), 4);
    assert_eq!(null.overlap_node_p_value(0), (1, 1, 1.0));
    // Duplicates tally once per qualifying series.
    assert_eq!(null.overlap_node_p_value(1), (2, 1, 2.0));
}

#[test]
fn overlap_is_empty_if_any_series_has_no_components() {
    let spec = DataSeriesSpec::new("s", 1.0, 6);
    let empty = Graph::from_t_stats(&vec![0.0; 36], &spec);
    assert_eq!(empty.component_count(), 0);

    let mut result = MultiSeriesResult::new();
    result.push("base", edge_graph(&spec, &[(0, 1), (1, 2)]));
    result.push("second", edge_graph(&spec, &[(0, 1)]));
    result.push("third", empty);

    // The empty series wipes out the overlap already accumulated from earlier series.
    assert!(result.node_overlap().is_empty());
}

#[test]
fn overlap_histogram_counts_iterations_by_overlap_size() {
    let specs = [
        DataSeriesSpec::new("base", 1.0, 6),
        DataSeriesSpec::new("other", 1.0, 6),
    ];
    let spec = &specs[0];
    let base = || edge_graph(spec, &[(0, 1), (1, 2), (2, 3)]);

    // Overlap counts 2, 0, 1, 3, 2 across five iterations.
    let others = [
        edge_graph(spec, &[(0, 1)]),
        edge_graph(spec, &[(4, 5)]),
        edge_graph(spec, &[(3, 4)]),
        edge_graph(spec, &[(0, 1), (1, 2)]),
        edge_graph(spec, &[(1, 2)]),
    ];

    let mut null = NullDistribution::new(&specs, others.len());
    for other in others.iter() {
        let mut result = MultiSeriesResult::new();
        result.push("base", base());
        result.push("other", other.clone());
        null.record(&result);
    }

    assert_eq!(null.max_overlap_count(), 3);
    assert_eq!(null.overlap_histogram(), vec![1, 1, 2, 1]);
}

#[test]
fn validation_errors_surface_before_computation() {
    let specs = [DataSeriesSpec::new("A", 1.0, 2)];
    let good: Vec<TestSubject> = (0..3)
        .map(|id| subject(id, vec![("A", vec![1.0; 4])]))
        .collect();
    let good: Vec<&TestSubject> = good.iter().collect();

    let none: [&TestSubject; 0] = [];
    assert!(matches!(
        SeriesCache::build(&none, &good, &specs),
        Err(NbsError::EmptyGroup { group: "group1" })
    ));
    assert!(matches!(
        SeriesCache::build(&good, &none, &specs),
        Err(NbsError::EmptyGroup { group: "group2" })
    ));

    let short = subject(9, vec![("A", vec![1.0; 3])]);
    let bad = [&short];
    assert!(matches!(
        SeriesCache::build(&good, &bad, &specs),
        Err(NbsError::ShapeMismatch {
            expected: 4,
            actual: 3,
            ..
        })
    ));

    let unlabeled = subject(9, vec![]);
    let bad = [&unlabeled];
    assert!(matches!(
        SeriesCache::build(&good, &bad, &specs),
        Err(NbsError::MissingSeries { .. })
    ));

    let mut rng = StdRng::seed_from_u64(1);
    let other: Vec<TestSubject> = (3..6)
        .map(|id| subject(id, vec![("A", vec![1.0; 4])]))
        .collect();
    let other: Vec<&TestSubject> = other.iter().collect();
    assert!(matches!(
        compare(&good, &other, &specs, 0, &mut rng),
        Err(NbsError::ZeroIterations)
    ));
}

#[test]
fn cancelled_flag_aborts_the_permutation_loop() {
    let specs = [DataSeriesSpec::new("A", 1.0, 2)];
    let group1: Vec<TestSubject> = (0..3)
        .map(|id| subject(id, vec![("A", vec![1.0; 4])]))
        .collect();
    let group2: Vec<TestSubject> = (3..6)
        .map(|id| subject(id, vec![("A", vec![2.0; 4])]))
        .collect();
    let group1: Vec<&TestSubject> = group1.iter().collect();
    let group2: Vec<&TestSubject> = group2.iter().collect();

    let cancel = CancelFlag::new();
    cancel.cancel();

    let mut rng = StdRng::seed_from_u64(1);
    assert!(matches!(
        compare_cancellable(&group1, &group2, &specs, 1000, &mut rng, &cancel),
        Err(NbsError::Cancelled)
    ));
}
