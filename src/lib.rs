#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate implements the Network-Based Statistic (NBS), as described in:
//!
//! - Zalesky, Fornito, Bullmore, [Network-based statistic: Identifying differences in brain
//!   networks][nbs], NeuroImage, 2010
//!
//! [nbs]: https://doi.org/10.1016/j.neuroimage.2010.06.041
//!
//! Given two groups of subjects, each carrying one or more flattened node-by-node connectivity
//! matrices ("data series"), the NBS finds connected subnetworks of edges that differ between the
//! groups, and corrects for multiple comparisons at the network level: instead of adjusting each
//! edge's p-value, it compares the size of each observed connected component against an empirical
//! null distribution of largest-component sizes obtained by repeatedly re-partitioning the pooled
//! subjects into two random groups of the original sizes.
//!
//! The pipeline is: stack every subject's feature rows once ([`SeriesCache::build`]), run an
//! unpaired two-sample t-test across every edge ([`SeriesCache::t_test`]), keep the edges whose
//! absolute t-statistic exceeds the series threshold and decompose them into connected components
//! ([`Graph::from_t_stats`]), then repeat the whole thing over shuffled group assignments
//! ([`SeriesCache::permutation_null`]) and convert observed component sizes into empirical
//! p-values ([`NullDistribution::component_p_value`]). [`compare`] ties all of it together.
//!
//! ```
//! use nbs::{compare, DataSeriesSpec, Subject};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use std::collections::HashMap;
//!
//! struct Demo {
//!     id: u32,
//!     series: HashMap<String, Vec<f64>>,
//! }
//!
//! impl Subject for Demo {
//!     type Id = u32;
//!     fn id(&self) -> u32 {
//!         self.id
//!     }
//!     fn series(&self, label: &str) -> Option<&[f64]> {
//!         self.series.get(label).map(|v| &v[..])
//!     }
//! }
//!
//! let subject = |id: u32, edge: f64| {
//!     let mut series = HashMap::new();
//!     series.insert("alpha".to_owned(), vec![0.0, edge, edge, 0.0]);
//!     Demo { id, series }
//! };
//!
//! let group1: Vec<Demo> = (0..4).map(|id| subject(id, 1.0 + f64::from(id) * 0.01)).collect();
//! let group2: Vec<Demo> = (4..8).map(|id| subject(id, 9.0 + f64::from(id) * 0.01)).collect();
//! let group1: Vec<&Demo> = group1.iter().collect();
//! let group2: Vec<&Demo> = group2.iter().collect();
//!
//! let specs = [DataSeriesSpec::new("alpha", 2.0, 2)];
//! let mut rng = StdRng::seed_from_u64(7);
//! let result = compare(&group1, &group2, &specs, 20, &mut rng).unwrap();
//!
//! let graph = result.actual().graph("alpha").unwrap();
//! assert_eq!(graph.largest_component_size(), 1);
//! assert_eq!(result.null_distribution().iterations(), 20);
//! ```

use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;
use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByItemExt;
use sorted_iter::sorted_iterator::SortedByItem;
use sorted_iter::SortedIterator;
use statrs::distribution::{StudentsT, Univariate};
use std::collections::HashMap;
use std::iter;
use std::mem::swap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors surfaced by cache construction and the comparison pipeline.
///
/// Degenerate statistics (for example an edge with zero variance in both groups) are *not*
/// errors; they resolve to a defined statistic in [`SeriesCache::t_test`].
#[derive(Debug, Error)]
pub enum NbsError {
    /// A subject's flattened feature vector for some series does not contain exactly
    /// `node_count * node_count` entries. Truncating or padding here would silently corrupt the
    /// matrix reshape downstream, so this is fatal.
    #[error("subject {subject} has {actual} features for series {label:?}, expected {expected}")]
    ShapeMismatch {
        /// Debug rendering of the offending subject's identity.
        subject: String,
        /// The series label being cached.
        label: String,
        /// `node_count * node_count` for the series.
        expected: usize,
        /// The length actually provided by the subject.
        actual: usize,
    },

    /// A subject has no feature data at all for a requested series label.
    #[error("subject {subject} has no data for series {label:?}")]
    MissingSeries {
        /// Debug rendering of the offending subject's identity.
        subject: String,
        /// The series label being cached.
        label: String,
    },

    /// One of the two groups contains no subjects. Checked before any computation.
    #[error("group {group} contains no subjects")]
    EmptyGroup {
        /// Which group was empty, `"group1"` or `"group2"`.
        group: &'static str,
    },

    /// The permutation iteration count was zero.
    #[error("iteration count must be positive")]
    ZeroIterations,

    /// The permutation loop observed a raised [`CancelFlag`] and stopped. No partial null
    /// distribution is returned; the integrity of the empirical p-values requires every
    /// iteration to have run.
    #[error("permutation run cancelled")]
    Cancelled,
}

/// Types which can identify a [`Subject`].
///
/// Identities are copied freely: the permutation engine shuffles a pooled roster of them once
/// per iteration. Anything cheap and totally ordered works, including interned string keys such
/// as the `lasso` spur types.
pub trait SubjectId: Copy + Eq + Ord + std::hash::Hash + std::fmt::Debug {}

impl<T: Copy + Eq + Ord + std::hash::Hash + std::fmt::Debug> SubjectId for T {}

/// A subject under comparison, owned by the caller.
///
/// The engine never mutates a subject, and reads each of its series exactly once, while
/// building a [`SeriesCache`].
pub trait Subject {
    /// The subject's identity type.
    type Id: SubjectId;

    /// A stable identity, unique within the union of both groups.
    fn id(&self) -> Self::Id;

    /// The flattened node-by-node feature matrix for the given series label, in row-major order,
    /// or `None` if this subject has no data for that series.
    fn series(&self, label: &str) -> Option<&[f64]>;
}

/// One data series under test: a named family of features with its own statistical threshold and
/// node count.
///
/// Every subject's feature vector for this series must hold exactly
/// [`feature_count`](DataSeriesSpec::feature_count) entries, the row-major flattening of a
/// square node-by-node matrix.
#[derive(Clone, Debug)]
pub struct DataSeriesSpec {
    /// Name of the series, unique within one comparison.
    pub label: String,
    /// Cells whose absolute t-statistic strictly exceeds this become supra-threshold edges.
    pub threshold: f64,
    /// Number of nodes on each axis of the underlying matrix.
    pub node_count: usize,
}

impl DataSeriesSpec {
    /// Creates a spec for a series of `node_count * node_count` features.
    pub fn new(label: impl Into<String>, threshold: f64, node_count: usize) -> Self {
        DataSeriesSpec {
            label: label.into(),
            threshold,
            node_count,
        }
    }

    /// The expected length of each subject's flattened feature vector.
    pub fn feature_count(&self) -> usize {
        self.node_count * self.node_count
    }
}

/// A sorted set of node indices.
///
/// Components of a supra-threshold graph are usually small relative to the full matrix, so this
/// avoids heap allocations for sets of up to four nodes. The inline array is sized so the whole
/// set occupies the same space as the smallest possible `SmallVec`.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeSet(SmallVec<[u32; 4]>);

impl NodeSet {
    /// Creates a node set containing the specified nodes.
    ///
    /// It's okay if the provided slice contains duplicates.
    ///
    /// ```
    /// use nbs::NodeSet;
    ///
    /// let set = NodeSet::new(&[2, 0, 2, 5]);
    /// assert_eq!(set.len(), 3);
    /// assert!(set.contains(5));
    /// assert!(!set.contains(1));
    /// ```
    pub fn new(nodes: &[u32]) -> Self {
        let mut v = SmallVec::from_slice(nodes);
        v.sort_unstable();
        v.dedup();
        NodeSet(v)
    }

    /// The number of nodes in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no nodes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if the set contains the given node.
    pub fn contains(&self, node: u32) -> bool {
        self.0.binary_search(&node).is_ok()
    }

    /// Returns an iterator over the nodes in this set, in ascending order.
    ///
    /// ```
    /// use nbs::NodeSet;
    ///
    /// let set = NodeSet::new(&[3, 1, 2]);
    /// let mut it = set.iter();
    /// assert_eq!(it.next(), Some(1));
    /// assert_eq!(it.next(), Some(2));
    /// assert_eq!(it.next(), Some(3));
    /// assert_eq!(it.next(), None);
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = u32> + SortedByItem + Clone + '_ {
        self.0.iter().copied().assume_sorted_by_item()
    }

    /// Returns `true` if `other` contains every node that `self` does.
    ///
    /// ```
    /// use nbs::NodeSet;
    /// let nil = NodeSet::new(&[]);
    /// let one = NodeSet::new(&[1]);
    ///
    /// assert!(nil.is_subset(&one));
    /// assert!(one.is_subset(&one));
    /// assert!(!one.is_subset(&nil));
    /// ```
    pub fn is_subset(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.iter().intersection(other.iter()).eq(self.iter())
    }
}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl iter::FromIterator<u32> for NodeSet {
    /// Creates a node set containing the specified nodes.
    ///
    /// It's okay if the provided iterator contains duplicates.
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut v = SmallVec::from_iter(iter);
        v.sort_unstable();
        v.dedup();
        NodeSet(v)
    }
}

/// A maximal connected subgraph of supra-threshold edges.
#[derive(Clone, Debug)]
pub struct Component {
    nodes: NodeSet,
    edges: Vec<(u32, u32)>,
    p_value: Option<f64>,
}

impl Component {
    /// The nodes touched by this component's edges.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// The edges of this component, as normalized `(low, high)` node pairs in ascending order.
    pub fn edges(&self) -> &[(u32, u32)] {
        &self.edges
    }

    /// The size of this component, measured in edges. This is the extent that the null
    /// distribution is built over.
    pub fn size(&self) -> usize {
        self.edges.len()
    }

    /// The number of distinct nodes in this component.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The empirical p-value for this component's size, populated by [`compare`] only on
    /// components of the actual (non-permuted) result.
    pub fn p_value(&self) -> Option<f64> {
        self.p_value
    }
}

// Union-find over dense node indices, with path halving and union by rank. Nodes that touch no
// supra-threshold edge never get looked up, so the flat arrays stay cheap even though they cover
// the whole matrix axis.
struct DisjointSets {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        DisjointSets {
            parent: (0..len as u32).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let mut a = self.find(a);
        let mut b = self.find(b);

        if a == b {
            return;
        }

        if self.rank[a as usize] < self.rank[b as usize] {
            swap(&mut a, &mut b);
        }

        self.parent[b as usize] = a;

        if self.rank[a as usize] == self.rank[b as usize] {
            self.rank[a as usize] += 1;
        }
    }
}

/// An undirected graph of supra-threshold edges, decomposed into connected components.
///
/// Every edge belongs to exactly one [`Component`]. A graph built from a matrix with no
/// supra-threshold cells has zero components and no largest component.
#[derive(Clone, Debug)]
pub struct Graph {
    components: Vec<Component>,
    // Index into `components` of the component with the most edges; ties keep the component
    // that was encountered first.
    largest: Option<usize>,
}

impl Graph {
    /// Builds a graph from a flattened t-statistic vector.
    ///
    /// The vector is interpreted as a row-major `node_count` by `node_count` matrix; every cell
    /// whose absolute value strictly exceeds the series threshold contributes the undirected
    /// edge `(row, col)`. The `(i, j)` and `(j, i)` cells of a symmetric matrix yield a single
    /// edge; asymmetric input simply deduplicates the same way.
    ///
    /// # Panics
    ///
    /// Panics if `t_stats` does not hold exactly [`DataSeriesSpec::feature_count`] entries.
    ///
    /// ```
    /// use nbs::{DataSeriesSpec, Graph};
    ///
    /// let spec = DataSeriesSpec::new("alpha", 1.0, 3);
    /// let t = [
    ///     0.0, 2.5, 0.0, //
    ///     2.5, 0.0, 0.0, //
    ///     0.0, 0.0, 0.0,
    /// ];
    ///
    /// let graph = Graph::from_t_stats(&t, &spec);
    /// assert_eq!(graph.component_count(), 1);
    /// assert_eq!(graph.largest_component_size(), 1);
    ///
    /// let empty = Graph::from_t_stats(&[0.0; 9], &spec);
    /// assert_eq!(empty.component_count(), 0);
    /// assert_eq!(empty.largest_component_size(), 0);
    /// ```
    pub fn from_t_stats(t_stats: &[f64], spec: &DataSeriesSpec) -> Graph {
        let n = spec.node_count;
        assert_eq!(t_stats.len(), spec.feature_count());

        let mut edges = Vec::new();
        for row in 0..n {
            for col in 0..n {
                if t_stats[row * n + col].abs() > spec.threshold {
                    // Normalize so both triangles of the matrix name the same edge.
                    let (a, b) = if row <= col { (row, col) } else { (col, row) };
                    edges.push((a as u32, b as u32));
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();

        let mut sets = DisjointSets::new(n);
        for &(a, b) in edges.iter() {
            sets.union(a, b);
        }

        // Group edges by their component root, numbering components in order of the first edge
        // seen for each root so the decomposition is deterministic.
        let mut component_index = HashMap::new();
        let mut grouped: Vec<Vec<(u32, u32)>> = Vec::new();
        for &(a, b) in edges.iter() {
            let root = sets.find(a);
            let next = grouped.len();
            let idx = *component_index.entry(root).or_insert(next);
            if idx == next {
                grouped.push(Vec::new());
            }
            grouped[idx].push((a, b));
        }

        let components: Vec<Component> = grouped
            .into_iter()
            .map(|edges| {
                let nodes = edges
                    .iter()
                    .flat_map(|&(a, b)| iter::once(a).chain(iter::once(b)))
                    .collect();
                Component {
                    nodes,
                    edges,
                    p_value: None,
                }
            })
            .collect();

        let mut largest: Option<usize> = None;
        for (idx, component) in components.iter().enumerate() {
            let bigger = match largest {
                None => true,
                Some(at) => component.size() > components[at].size(),
            };
            if bigger {
                largest = Some(idx);
            }
        }

        Graph {
            components,
            largest,
        }
    }

    /// The connected components of this graph, in order of discovery.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// The number of connected components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// The component with the most edges, if the graph has any edges at all.
    pub fn largest_component(&self) -> Option<&Component> {
        self.largest.map(|idx| &self.components[idx])
    }

    /// The edge count of the largest component, or 0 for a graph with no components.
    pub fn largest_component_size(&self) -> usize {
        self.largest_component().map_or(0, Component::size)
    }
}

/// One graph per data series, for a single two-group comparison (actual or permuted).
///
/// Series appear in the order of the [`DataSeriesSpec`] slice the comparison ran over. That
/// order matters: the first series is the *base* of
/// [`node_overlap`](MultiSeriesResult::node_overlap).
#[derive(Debug, Default)]
pub struct MultiSeriesResult {
    series: Vec<(String, Graph)>,
}

impl MultiSeriesResult {
    /// Creates an empty result.
    pub fn new() -> Self {
        MultiSeriesResult { series: Vec::new() }
    }

    /// Appends the graph for one series. Callers are expected to push series in spec order.
    pub fn push(&mut self, label: impl Into<String>, graph: Graph) -> &mut Self {
        self.series.push((label.into(), graph));
        self
    }

    /// Looks up the graph for a series by label.
    pub fn graph(&self, label: &str) -> Option<&Graph> {
        self.series
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, graph)| graph)
    }

    /// Returns an iterator over the series in this result, in spec order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Graph)> + '_ {
        self.series.iter().map(|(label, graph)| (&label[..], graph))
    }

    /// Computes the node overlap sequence across the largest components of every series.
    ///
    /// The first series' largest-component node set is the base. Every *subsequent* series
    /// appends each node of its own largest component that also occurs in the base, in
    /// ascending node order. If any series has no largest component, the overlap for the whole
    /// result is empty. A single-series result has no subsequent series, so its overlap is
    /// empty too.
    ///
    /// Note that this is not a progressive intersection: with three or more series a node can
    /// appear once per qualifying series, and consumers tally those duplicates as-is. The
    /// reference NBS implementation behaves this way and the empirical overlap p-values depend
    /// on it, so a true multi-way intersection would be a behavior change.
    pub fn node_overlap(&self) -> Vec<u32> {
        let mut base: Option<&NodeSet> = None;
        let mut overlap = Vec::new();

        for (_, graph) in self.series.iter() {
            let largest = match graph.largest_component() {
                Some(component) => component,
                None => return Vec::new(),
            };

            match base {
                None => base = Some(largest.nodes()),
                Some(base) => {
                    overlap.extend(largest.nodes().iter().intersection(base.iter()));
                }
            }
        }

        overlap
    }
}

/// The per-edge outcome of one two-sample t-test over one series.
///
/// Both vectors are aligned with the row-major flattening order of the cached feature vectors.
#[derive(Clone, Debug)]
pub struct EdgeTestResult {
    /// The t-statistic for each feature.
    pub t_stats: Vec<f64>,
    /// The two-sided p-value for each feature.
    pub p_values: Vec<f64>,
}

struct CachedSeries<S: SubjectId> {
    rows: HashMap<S, usize>,
    // subject_count rows of feature_count columns, row-major, in roster order (group1 followed
    // by group2).
    data: Vec<f64>,
    feature_count: usize,
}

impl<S: SubjectId> CachedSeries<S> {
    fn row(&self, subject: S) -> &[f64] {
        let idx = self.rows[&subject];
        &self.data[idx * self.feature_count..(idx + 1) * self.feature_count]
    }

    // Per-column mean and sum of squared deviations for the given subjects. Two passes, each
    // walking whole rows so the dense buffer is read in order.
    fn moments(&self, subjects: &[S]) -> (Vec<f64>, Vec<f64>) {
        let count = subjects.len() as f64;
        let mut means = vec![0.0; self.feature_count];
        for &subject in subjects {
            for (mean, value) in means.iter_mut().zip(self.row(subject)) {
                *mean += value;
            }
        }
        for mean in means.iter_mut() {
            *mean /= count;
        }

        let mut squared_deviations = vec![0.0; self.feature_count];
        for &subject in subjects {
            let row = self.row(subject);
            for (feature, acc) in squared_deviations.iter_mut().enumerate() {
                let deviation = row[feature] - means[feature];
                *acc += deviation * deviation;
            }
        }

        (means, squared_deviations)
    }
}

/// Every subject's feature rows for every series, stacked into dense matrices once per
/// comparison.
///
/// Building the cache validates all input data up front, so the permutation loop can re-select
/// rows thousands of times without touching the [`Subject`]s again and without re-checking
/// shapes. The cache is read-only after construction.
pub struct SeriesCache<'a, S: SubjectId> {
    specs: &'a [DataSeriesSpec],
    series: Vec<CachedSeries<S>>,
}

impl<'a, S: SubjectId> SeriesCache<'a, S> {
    /// Stacks the feature vectors of both groups, in roster order (all of `group1` followed by
    /// all of `group2`), into one dense matrix per series.
    ///
    /// Fails with [`NbsError::EmptyGroup`] before reading any data, with
    /// [`NbsError::MissingSeries`] if a subject has no data for some series, and with
    /// [`NbsError::ShapeMismatch`] if a subject's flattened vector is not exactly
    /// `node_count * node_count` long. Thresholds are not inspected here.
    pub fn build<T>(
        group1: &[&T],
        group2: &[&T],
        specs: &'a [DataSeriesSpec],
    ) -> Result<Self, NbsError>
    where
        T: Subject<Id = S>,
    {
        if group1.is_empty() {
            return Err(NbsError::EmptyGroup { group: "group1" });
        }
        if group2.is_empty() {
            return Err(NbsError::EmptyGroup { group: "group2" });
        }

        let roster: Vec<&T> = group1.iter().chain(group2.iter()).copied().collect();

        let mut series = Vec::with_capacity(specs.len());
        for spec in specs.iter() {
            let feature_count = spec.feature_count();
            let mut rows = HashMap::with_capacity(roster.len());
            let mut data = Vec::with_capacity(roster.len() * feature_count);

            for (idx, subject) in roster.iter().enumerate() {
                let features =
                    subject
                        .series(&spec.label)
                        .ok_or_else(|| NbsError::MissingSeries {
                            subject: format!("{:?}", subject.id()),
                            label: spec.label.clone(),
                        })?;
                if features.len() != feature_count {
                    return Err(NbsError::ShapeMismatch {
                        subject: format!("{:?}", subject.id()),
                        label: spec.label.clone(),
                        expected: feature_count,
                        actual: features.len(),
                    });
                }
                rows.insert(subject.id(), idx);
                data.extend_from_slice(features);
            }

            series.push(CachedSeries {
                rows,
                data,
                feature_count,
            });
        }

        Ok(SeriesCache { specs, series })
    }

    /// The specs this cache was built over, in series order.
    pub fn specs(&self) -> &[DataSeriesSpec] {
        self.specs
    }

    /// Runs an unpaired two-sample t-test independently on every feature column of one series,
    /// comparing the cached rows of `group1` against those of `group2`.
    ///
    /// This is the pooled-variance (Student) form with `n1 + n2 - 2` degrees of freedom, with
    /// two-sided p-values from the t distribution's CDF. The order of identities within a group
    /// does not affect the statistic.
    ///
    /// Degenerate features resolve to a defined statistic instead of erroring: zero pooled
    /// variance with equal group means yields `t = 0, p = 1`; zero pooled variance with unequal
    /// means yields an infinite t and `p = 0`. With fewer than three subjects in total there
    /// are no degrees of freedom, and every feature degrades to `t = 0, p = 1`.
    ///
    /// # Panics
    ///
    /// Panics if `series` is out of range, if either group is empty, or if any identity was not
    /// part of the roster this cache was built from.
    pub fn t_test(&self, series: usize, group1: &[S], group2: &[S]) -> EdgeTestResult {
        assert!(!group1.is_empty() && !group2.is_empty());
        let cached = &self.series[series];

        let n1 = group1.len() as f64;
        let n2 = group2.len() as f64;
        let (means1, dev1) = cached.moments(group1);
        let (means2, dev2) = cached.moments(group2);

        let df = n1 + n2 - 2.0;
        let t_dist = if df > 0.0 {
            // df is positive and finite, so this can't fail.
            Some(StudentsT::new(0.0, 1.0, df).unwrap())
        } else {
            None
        };

        let mut t_stats = Vec::with_capacity(cached.feature_count);
        let mut p_values = Vec::with_capacity(cached.feature_count);
        for feature in 0..cached.feature_count {
            let difference = means1[feature] - means2[feature];
            let (t, p) = match &t_dist {
                None => (0.0, 1.0),
                Some(t_dist) => {
                    let pooled_variance = (dev1[feature] + dev2[feature]) / df;
                    let standard_error = (pooled_variance * (1.0 / n1 + 1.0 / n2)).sqrt();
                    if standard_error > 0.0 {
                        let t = difference / standard_error;
                        (t, 2.0 * (1.0 - t_dist.cdf(t.abs())))
                    } else if difference == 0.0 {
                        // Zero variance in both groups and equal means: the statistic is 0/0.
                        (0.0, 1.0)
                    } else {
                        (difference.signum() * f64::INFINITY, 0.0)
                    }
                }
            };
            t_stats.push(t);
            p_values.push(p);
        }

        EdgeTestResult { t_stats, p_values }
    }

    /// Runs the t-test and graph construction for every series, producing one [`Graph`] per
    /// series for this particular assignment of identities to groups.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`SeriesCache::t_test`].
    pub fn compare_groups(&self, group1: &[S], group2: &[S]) -> MultiSeriesResult {
        let mut result = MultiSeriesResult::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            let tested = self.t_test(idx, group1, group2);
            result.push(
                spec.label.clone(),
                Graph::from_t_stats(&tested.t_stats, spec),
            );
        }
        result
    }

    /// Builds the empirical null distribution by rerunning the comparison over random group
    /// assignments.
    ///
    /// All identities are pooled into one roster. Each iteration reshuffles the whole roster,
    /// takes the first `group1.len()` identities as the permuted group 1 and the next
    /// `group2.len()` as the permuted group 2, reruns
    /// [`compare_groups`](SeriesCache::compare_groups), and records the outcome. Iterations are
    /// independent; only the accumulated counts matter, not which iteration produced them.
    ///
    /// The `cancel` flag is checked once per iteration. Raising it aborts the whole run with
    /// [`NbsError::Cancelled`] rather than returning a partial distribution.
    pub fn permutation_null<R>(
        &self,
        group1: &[S],
        group2: &[S],
        iterations: usize,
        rng: &mut R,
        cancel: &CancelFlag,
    ) -> Result<NullDistribution, NbsError>
    where
        R: Rng + ?Sized,
    {
        let mut pool = Vec::with_capacity(group1.len() + group2.len());
        pool.extend_from_slice(group1);
        pool.extend_from_slice(group2);

        debug!(
            "building null distribution: {} iterations over {} pooled subjects",
            iterations,
            pool.len()
        );

        let mut null = NullDistribution::new(self.specs, iterations);
        for _ in 0..iterations {
            if cancel.is_cancelled() {
                return Err(NbsError::Cancelled);
            }

            pool.shuffle(rng);
            let (permuted1, rest) = pool.split_at(group1.len());
            let permuted = self.compare_groups(permuted1, &rest[..group2.len()]);
            null.record(&permuted);
        }

        Ok(null)
    }
}

/// The null distribution accumulated across all permutation iterations.
///
/// Everything in here is append-only while the permutation loop runs, and read only afterwards:
/// per series, the sequence of largest-component sizes (one entry per iteration); per
/// iteration, the length of the node overlap sequence; per node, a running tally of the
/// iterations whose overlap sequence contained it (counting duplicates within one iteration
/// multiple times).
#[derive(Debug)]
pub struct NullDistribution {
    sizes_by_series: Vec<(String, Vec<usize>)>,
    overlap_counts: Vec<usize>,
    node_tallies: HashMap<u32, usize>,
    iterations: usize,
}

impl NullDistribution {
    /// Creates an empty distribution for the given series, preallocating every per-iteration
    /// sequence to `expected_iterations` entries.
    pub fn new(specs: &[DataSeriesSpec], expected_iterations: usize) -> Self {
        NullDistribution {
            sizes_by_series: specs
                .iter()
                .map(|spec| (spec.label.clone(), Vec::with_capacity(expected_iterations)))
                .collect(),
            overlap_counts: Vec::with_capacity(expected_iterations),
            node_tallies: HashMap::new(),
            iterations: 0,
        }
    }

    /// Appends one iteration's outcome: every series' largest-component size (0 when a series'
    /// graph has no components), the overlap count, and the per-node overlap tallies.
    pub fn record(&mut self, result: &MultiSeriesResult) {
        for (label, sizes) in self.sizes_by_series.iter_mut() {
            let size = result.graph(label).map_or(0, Graph::largest_component_size);
            sizes.push(size);
        }

        let overlap = result.node_overlap();
        self.overlap_counts.push(overlap.len());
        for node in overlap {
            *self.node_tallies.entry(node).or_insert(0) += 1;
        }

        self.iterations += 1;
    }

    /// The number of iterations recorded so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The recorded largest-component sizes for one series, one entry per iteration.
    pub fn series_sizes(&self, label: &str) -> Option<&[usize]> {
        self.sizes_by_series
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, sizes)| &sizes[..])
    }

    /// The empirical p-value for observing a component of `observed_size` edges in the given
    /// series: the fraction of iterations whose largest component was *strictly* larger.
    ///
    /// When no iteration produced a larger component this returns exactly 0, not
    /// `1 / iterations`. That understates the tail probability slightly, but it is how the
    /// reference implementation behaves and published results depend on it.
    pub fn component_p_value(&self, label: &str, observed_size: usize) -> f64 {
        let sizes = match self.series_sizes(label) {
            Some(sizes) => sizes,
            None => return 0.0,
        };

        let larger = sizes.iter().filter(|&&size| size > observed_size).count();
        if larger > 0 {
            larger as f64 / self.iterations as f64
        } else {
            0.0
        }
    }

    /// The empirical p-value for one node's membership in the overlap sequence, as
    /// `(tally, iterations, tally / iterations)`. A node that never appeared yields
    /// `(0, iterations, 0.0)`.
    pub fn overlap_node_p_value(&self, node: u32) -> (usize, usize, f64) {
        match self.node_tallies.get(&node) {
            Some(&tally) => (tally, self.iterations, tally as f64 / self.iterations as f64),
            None => (0, self.iterations, 0.0),
        }
    }

    /// The largest overlap count produced by any recorded iteration.
    pub fn max_overlap_count(&self) -> usize {
        self.overlap_counts.iter().copied().max().unwrap_or(0)
    }

    /// A histogram of overlap counts: entry `i` is the number of iterations whose overlap
    /// sequence had length `i`, for `i` in `0..=max_overlap_count`. Empty if nothing has been
    /// recorded.
    pub fn overlap_histogram(&self) -> Vec<usize> {
        if self.overlap_counts.is_empty() {
            return Vec::new();
        }

        let mut histogram = vec![0; self.max_overlap_count() + 1];
        for &count in self.overlap_counts.iter() {
            histogram[count] += 1;
        }
        histogram
    }
}

/// A cooperative cancellation flag for the permutation loop.
///
/// The engine checks the flag once per iteration, so wrap one in an [`Arc`](std::sync::Arc)
/// and raise it from another thread to stop a long run early. A cancelled run returns
/// [`NbsError::Cancelled`] and discards its partial distribution.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// Creates a flag in the not-cancelled state.
    pub fn new() -> Self {
        CancelFlag(AtomicBool::new(false))
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once [`cancel`](CancelFlag::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The outcome of a full comparison: the actual result with annotated components, plus the
/// permutation null distribution for overlap queries.
#[derive(Debug)]
pub struct ComparisonResult {
    actual: MultiSeriesResult,
    null: NullDistribution,
}

impl ComparisonResult {
    /// The comparison of the true group assignment. Every component carries the empirical
    /// p-value for its size.
    pub fn actual(&self) -> &MultiSeriesResult {
        &self.actual
    }

    /// The accumulated null distribution.
    pub fn null_distribution(&self) -> &NullDistribution {
        &self.null
    }

    /// Splits this result into its two halves.
    pub fn into_parts(self) -> (MultiSeriesResult, NullDistribution) {
        (self.actual, self.null)
    }
}

/// Runs the whole NBS pipeline: caches both groups' data, compares the true group assignment,
/// builds the null distribution over `iterations` random re-partitions, and annotates every
/// component of the actual result with its empirical p-value.
///
/// The groups must be disjoint and each subject's identity unique across both.
pub fn compare<T, R>(
    group1: &[&T],
    group2: &[&T],
    specs: &[DataSeriesSpec],
    iterations: usize,
    rng: &mut R,
) -> Result<ComparisonResult, NbsError>
where
    T: Subject,
    R: Rng + ?Sized,
{
    compare_cancellable(group1, group2, specs, iterations, rng, &CancelFlag::new())
}

/// Like [`compare`], but checks `cancel` once per permutation iteration.
pub fn compare_cancellable<T, R>(
    group1: &[&T],
    group2: &[&T],
    specs: &[DataSeriesSpec],
    iterations: usize,
    rng: &mut R,
    cancel: &CancelFlag,
) -> Result<ComparisonResult, NbsError>
where
    T: Subject,
    R: Rng + ?Sized,
{
    if iterations == 0 {
        return Err(NbsError::ZeroIterations);
    }

    let cache = SeriesCache::build(group1, group2, specs)?;
    let ids1: Vec<T::Id> = group1.iter().map(|subject| subject.id()).collect();
    let ids2: Vec<T::Id> = group2.iter().map(|subject| subject.id()).collect();

    debug!(
        "comparing {} vs {} subjects across {} series",
        ids1.len(),
        ids2.len(),
        specs.len()
    );

    let mut actual = cache.compare_groups(&ids1, &ids2);
    let null = cache.permutation_null(&ids1, &ids2, iterations, rng, cancel)?;

    for (label, graph) in actual.series.iter_mut() {
        for component in graph.components.iter_mut() {
            component.p_value = Some(null.component_p_value(label, component.size()));
        }
    }

    Ok(ComparisonResult { actual, null })
}
