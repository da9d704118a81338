//! End-to-end graph loading scenarios: parsing, matrix expansion, cycle
//! detection, and artifact-wiring validation through the public loader.

use sykli::graph::topo;
use sykli::{load_graph, SykliError};

fn doc(tasks: &str) -> String {
    format!(r#"{{"version": 1, "tasks": {}}}"#, tasks)
}

#[test]
fn basic_dag_layers_a_b_then_c() {
    let graph = load_graph(&doc(
        r#"[
            {"name": "a", "command": "true"},
            {"name": "b", "command": "true"},
            {"name": "c", "command": "true", "depends_on": ["a", "b"]}
        ]"#,
    ))
    .unwrap();

    let levels = topo::levels(&graph).unwrap();
    assert_eq!(levels.len(), 2);
    assert_eq!(levels[0], vec!["a", "b"]);
    assert_eq!(levels[1], vec!["c"]);
}

#[test]
fn matrix_fanout_produces_sorted_key_names() {
    let graph = load_graph(&doc(
        r#"[
            {"name": "test", "command": "make test",
             "matrix": {"os": ["linux", "macos"], "ver": ["1", "2"]}}
        ]"#,
    ))
    .unwrap();

    let names: Vec<&str> = graph.names().collect();
    assert_eq!(
        names,
        vec!["test-linux-1", "test-linux-2", "test-macos-1", "test-macos-2"]
    );

    let variant = graph.get("test-macos-2").unwrap();
    assert_eq!(variant.env.get("os").unwrap(), "macos");
    assert_eq!(variant.env.get("ver").unwrap(), "2");
    let values = variant.matrix_values.as_ref().unwrap();
    assert_eq!(values.get("os").unwrap(), "macos");
    assert_eq!(values.get("ver").unwrap(), "2");
}

#[test]
fn matrix_expansion_is_deterministic_across_loads() {
    let json = doc(
        r#"[
            {"name": "t", "command": "true",
             "matrix": {"a": ["1", "2"], "b": ["x", "y"], "c": ["p"]}}
        ]"#,
    );
    let first: Vec<String> = load_graph(&json).unwrap().names().map(String::from).collect();
    let second: Vec<String> = load_graph(&json).unwrap().names().map(String::from).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4); // 2 * 2 * 1
}

#[test]
fn dependency_on_matrix_name_rewrites_to_all_variants() {
    let graph = load_graph(&doc(
        r#"[
            {"name": "test", "command": "true", "matrix": {"os": ["linux", "macos"]}},
            {"name": "publish", "command": "true", "depends_on": ["test"]}
        ]"#,
    ))
    .unwrap();

    assert_eq!(
        graph.get("publish").unwrap().depends_on,
        vec!["test-linux", "test-macos"]
    );

    // Rewritten dependencies still layer correctly.
    let levels = topo::levels(&graph).unwrap();
    assert_eq!(levels[1], vec!["publish"]);
}

#[test]
fn three_cycle_is_reported_with_its_path() {
    let err = load_graph(&doc(
        r#"[
            {"name": "a", "command": "true", "depends_on": ["b"]},
            {"name": "b", "command": "true", "depends_on": ["c"]},
            {"name": "c", "command": "true", "depends_on": ["a"]}
        ]"#,
    ))
    .unwrap_err();

    assert_eq!(err.code(), "E010");
    let SykliError::CycleDetected { path } = err else {
        panic!("expected cycle");
    };
    assert_eq!(path.len(), 4);
    assert_eq!(path.first(), path.last());
    let mut nodes: Vec<&String> = path[..3].iter().collect();
    nodes.sort();
    nodes.dedup();
    assert_eq!(nodes.len(), 3);
}

#[test]
fn artifact_wiring_requires_declared_output_and_reachability() {
    // Valid: deploy depends on build and consumes its declared output.
    let ok = load_graph(&doc(
        r#"[
            {"name": "build", "command": "make", "outputs": {"bin": "out/app"}},
            {"name": "deploy", "command": "./deploy", "depends_on": ["build"],
             "task_inputs": [{"from_task": "build", "output": "bin", "dest": "./app"}]}
        ]"#,
    ));
    assert!(ok.is_ok());

    // Invalid: output name not declared by the producer.
    let err = load_graph(&doc(
        r#"[
            {"name": "build", "command": "make", "outputs": {"bin": "out/app"}},
            {"name": "deploy", "command": "./deploy", "depends_on": ["build"],
             "task_inputs": [{"from_task": "build", "output": "docs", "dest": "./d"}]}
        ]"#,
    ))
    .unwrap_err();
    assert_eq!(err.code(), "E013");

    // Invalid: producer exists but is not reachable via depends_on.
    let err = load_graph(&doc(
        r#"[
            {"name": "build", "command": "make", "outputs": {"bin": "out/app"}},
            {"name": "deploy", "command": "./deploy",
             "task_inputs": [{"from_task": "build", "output": "bin", "dest": "./app"}]}
        ]"#,
    ))
    .unwrap_err();
    assert_eq!(err.code(), "E013");
}

#[test]
fn outputs_list_normalization_survives_the_loader() {
    let graph = load_graph(&doc(
        r#"[
            {"name": "build", "command": "make", "outputs": ["a", "b", "c"]},
            {"name": "use", "command": "true", "depends_on": ["build"],
             "task_inputs": [{"from_task": "build", "output": "output_1", "dest": "./b"}]}
        ]"#,
    ))
    .unwrap();
    assert_eq!(graph.get("build").unwrap().outputs.len(), 3);
    assert_eq!(graph.get("build").unwrap().outputs.get("output_1").unwrap(), "b");
}

#[test]
fn matrix_variant_dependency_layers_only_that_variant_first() {
    let graph = load_graph(&doc(
        r#"[
            {"name": "test", "command": "true", "matrix": {"os": ["linux", "macos"]}},
            {"name": "gate", "command": "true", "depends_on": ["test-linux"]}
        ]"#,
    ))
    .unwrap();
    assert_eq!(graph.get("gate").unwrap().depends_on, vec!["test-linux"]);
}
