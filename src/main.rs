use csv_core::{ReadFieldResult, ReaderBuilder};
use lasso::{Rodeo, Spur};
use nbs::*;
use std::collections::HashMap;
use std::io;
use std::str;

/// One subject assembled from TSV records. Series labels map to flattened row-major
/// connectivity matrices.
struct LoadedSubject {
    id: Spur,
    series: HashMap<String, Vec<f64>>,
}

impl Subject for LoadedSubject {
    type Id = Spur;

    fn id(&self) -> Spur {
        self.id
    }

    fn series(&self, label: &str) -> Option<&[f64]> {
        self.series.get(label).map(|values| &values[..])
    }
}

struct Loaded {
    subjects: Vec<LoadedSubject>,
    group1: Vec<Spur>,
    group2: Vec<Spur>,
    labels: Vec<String>,
}

fn invalid<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// Reads tab-separated records of the form `group<TAB>subject<TAB>label<TAB>v1<TAB>v2...`,
/// where group is 1 or 2 and the remaining fields are the flattened feature matrix for that
/// subject and series.
fn load_data<I: io::Read>(mut input: I) -> io::Result<Loaded> {
    let mut inputbuf = [0; 16384];
    let mut fieldbuf = [0; 1024];
    let mut fieldlen = 0;
    let mut tsv = ReaderBuilder::new().delimiter(b'\t').build();

    let mut rodeo = Rodeo::new();
    let mut loaded = Loaded {
        subjects: Vec::new(),
        group1: Vec::new(),
        group2: Vec::new(),
        labels: Vec::new(),
    };
    let mut subject_index: HashMap<Spur, usize> = HashMap::new();

    // Per-record parse state.
    let mut field_index = 0;
    let mut group = 0u8;
    let mut subject: Option<Spur> = None;
    let mut label = String::new();
    let mut values = Vec::new();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = tsv.read_field(bytes, &mut fieldbuf[fieldlen..]);
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    return Err(invalid(format!("field too long on line {}", tsv.line())));
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen]).map_err(invalid)?;
                    fieldlen = 0;

                    match field_index {
                        0 => group = field.parse().map_err(invalid)?,
                        1 => subject = Some(rodeo.get_or_intern(field)),
                        2 => label = field.to_owned(),
                        _ => values.push(field.parse().map_err(invalid)?),
                    }
                    field_index += 1;

                    if record_end {
                        let id = subject
                            .take()
                            .ok_or_else(|| invalid(format!("short record on line {}", tsv.line())))?;
                        let roster = match group {
                            1 => &mut loaded.group1,
                            2 => &mut loaded.group2,
                            other => {
                                return Err(invalid(format!("unknown group {}", other)));
                            }
                        };

                        let subjects = &mut loaded.subjects;
                        let idx = *subject_index.entry(id).or_insert_with(|| {
                            roster.push(id);
                            subjects.push(LoadedSubject {
                                id,
                                series: HashMap::new(),
                            });
                            subjects.len() - 1
                        });

                        if !loaded.labels.iter().any(|l| *l == label) {
                            loaded.labels.push(label.clone());
                        }
                        loaded.subjects[idx]
                            .series
                            .insert(std::mem::take(&mut label), std::mem::take(&mut values));

                        field_index = 0;
                    }
                }
                ReadFieldResult::End => {
                    return Ok(loaded);
                }
            }
        }
    }
}

fn main() -> io::Result<()> {
    let threshold = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3.0);
    let iterations = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let loaded = load_data(io::stdin().lock())?;

    // Every series must be a flattened square matrix; infer the node count from the first
    // subject carrying it. Mismatched subjects are rejected by the cache build.
    let mut specs = Vec::with_capacity(loaded.labels.len());
    for label in loaded.labels.iter() {
        let features = loaded
            .subjects
            .iter()
            .find_map(|subject| subject.series.get(label))
            .map_or(0, Vec::len);
        let node_count = (features as f64).sqrt() as usize;
        if node_count * node_count != features {
            return Err(invalid(format!(
                "series {:?} has {} features, which is not a square matrix",
                label, features
            )));
        }
        specs.push(DataSeriesSpec::new(label.clone(), threshold, node_count));
    }

    let by_id: HashMap<Spur, &LoadedSubject> = loaded
        .subjects
        .iter()
        .map(|subject| (subject.id, subject))
        .collect();
    let group1: Vec<&LoadedSubject> = loaded.group1.iter().map(|id| by_id[id]).collect();
    let group2: Vec<&LoadedSubject> = loaded.group2.iter().map(|id| by_id[id]).collect();

    let result = compare(
        &group1,
        &group2,
        &specs,
        iterations,
        &mut rand::thread_rng(),
    )
    .map_err(invalid)?;

    println!(
        "{} vs {} subjects, threshold {}, {} permutations",
        group1.len(),
        group2.len(),
        threshold,
        iterations
    );

    for (label, graph) in result.actual().iter() {
        println!();
        println!("series {:?}: {} components", label, graph.component_count());
        for component in graph.components() {
            println!(
                "  {} edges over {} nodes, p = {:.4}",
                component.size(),
                component.node_count(),
                component.p_value().unwrap_or(1.0)
            );
            println!("    nodes: {:?}", component.nodes());
            println!("    edges: {:?}", component.edges());
        }
    }

    let overlap = result.actual().node_overlap();
    let null = result.null_distribution();
    println!();
    println!("observed node overlap: {:?}", overlap);
    println!("null max overlap count: {}", null.max_overlap_count());
    println!("null overlap histogram: {:?}", null.overlap_histogram());
    for node in overlap.iter().copied().collect::<NodeSet>().iter() {
        let (tally, iterations, ratio) = null.overlap_node_p_value(node);
        println!(
            "  node {}: overlapped in {} of {} permutations, p = {:.4}",
            node, tally, iterations, ratio
        );
    }

    Ok(())
}
