//! Executor scenarios against the real local driver: level ordering,
//! artifact passing, cache round trips, and blocking semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use sykli::cache::{CacheRepo, MissReason};
use sykli::events::{EventBus, EventKind, TOPIC_ALL};
use sykli::exec::{ExecOptions, Executor, TaskStatus};
use sykli::graph::{Graph, Task, TaskInput};
use sykli::target::local::LocalTarget;
use tempfile::TempDir;

fn task(name: &str, command: &str, deps: &[&str]) -> Task {
    Task {
        name: name.to_string(),
        command: command.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..Task::default()
    }
}

fn executor(tasks: Vec<Task>, work: &TempDir, cache: &TempDir) -> Executor {
    let graph = Graph::from_tasks(tasks).unwrap();
    Executor::new(
        graph,
        Arc::new(LocalTarget::new(work.path())),
        CacheRepo::at(cache.path()),
        EventBus::new(),
        ExecOptions {
            workdir: work.path().to_path_buf(),
            ..ExecOptions::default()
        },
    )
}

#[tokio::test]
async fn basic_dag_runs_c_after_a_and_b() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let exec = executor(
        vec![
            task("a", "echo a >> trace.txt", &[]),
            task("b", "echo b >> trace.txt", &[]),
            task("c", "echo c >> trace.txt", &["a", "b"]),
        ],
        &work,
        &cache,
    );
    let summary = exec.run().await.unwrap();

    assert!(summary.success());
    let trace = std::fs::read_to_string(work.path().join("trace.txt")).unwrap();
    let lines: Vec<&str> = trace.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2], "c");
    assert!(lines[..2].contains(&"a"));
    assert!(lines[..2].contains(&"b"));
}

#[tokio::test]
async fn artifact_is_copied_before_the_consumer_runs() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let mut build = task("build", "mkdir -p out && echo v1 > out/app", &[]);
    build.outputs = BTreeMap::from([("bin".to_string(), "out/app".to_string())]);

    let mut deploy = task("deploy", "cat ./app", &["build"]);
    deploy.task_inputs.push(TaskInput {
        from_task: "build".to_string(),
        output: "bin".to_string(),
        dest: "./app".to_string(),
    });

    let summary = executor(vec![build, deploy], &work, &cache)
        .run()
        .await
        .unwrap();

    assert!(summary.success());
    assert_eq!(summary.outcomes["deploy"].output, "v1");
    assert!(work.path().join("app").exists());
}

#[tokio::test]
async fn unrelated_change_hits_cache_and_input_change_misses() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    std::fs::create_dir(work.path().join("src")).unwrap();
    std::fs::write(work.path().join("src/main.go"), "package main").unwrap();
    std::fs::write(work.path().join("README.md"), "v1").unwrap();

    let mut build = task("build", "echo built > bin.txt", &[]);
    build.inputs = vec!["src/**/*.go".to_string()];
    build.outputs = BTreeMap::from([("bin".to_string(), "bin.txt".to_string())]);

    // First run executes.
    let summary = executor(vec![build.clone()], &work, &cache)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.outcomes["build"].status, TaskStatus::Passed);
    assert_eq!(
        summary.outcomes["build"].cache_miss,
        Some(MissReason::NoCache)
    );

    // README change does not touch the inputs: cached.
    std::fs::write(work.path().join("README.md"), "v2").unwrap();
    let summary = executor(vec![build.clone()], &work, &cache)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.outcomes["build"].status, TaskStatus::Cached);

    // Source change re-executes with the specific miss reason.
    std::fs::write(work.path().join("src/main.go"), "package main // v2").unwrap();
    let summary = executor(vec![build], &work, &cache).run().await.unwrap();
    assert_eq!(summary.outcomes["build"].status, TaskStatus::Passed);
    assert_eq!(
        summary.outcomes["build"].cache_miss,
        Some(MissReason::InputsChanged)
    );
}

#[tokio::test]
async fn failure_short_circuits_and_blocks_descendants() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let summary = executor(
        vec![
            task("ok", "true", &[]),
            task("bad", "exit 9", &[]),
            task("child", "echo ran > child.txt", &["bad"]),
            task("grandchild", "true", &["child"]),
        ],
        &work,
        &cache,
    )
    .run()
    .await
    .unwrap();

    assert!(!summary.success());
    assert_eq!(summary.outcomes["ok"].status, TaskStatus::Passed);
    assert_eq!(summary.outcomes["bad"].status, TaskStatus::Failed);
    assert_eq!(summary.outcomes["bad"].exit_code, Some(9));
    assert_eq!(summary.outcomes["child"].status, TaskStatus::Blocked);
    assert_eq!(summary.outcomes["grandchild"].status, TaskStatus::Blocked);
    assert!(!work.path().join("child.txt").exists());
}

#[tokio::test]
async fn events_trace_the_run_lifecycle() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let graph = Graph::from_tasks(vec![task("hello", "echo hi", &[])]).unwrap();
    let bus = EventBus::new();
    let mut rx = bus.subscribe(TOPIC_ALL);

    let exec = Executor::new(
        graph,
        Arc::new(LocalTarget::new(work.path())),
        CacheRepo::at(cache.path()),
        bus,
        ExecOptions {
            workdir: work.path().to_path_buf(),
            ..ExecOptions::default()
        },
    );
    exec.run().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&EventKind::RunStarted));
    assert_eq!(kinds.last(), Some(&EventKind::RunCompleted));
    assert!(kinds.contains(&EventKind::TaskStarted));
    assert!(kinds.contains(&EventKind::TaskOutput));
    assert!(kinds.contains(&EventKind::TaskCompleted));
}

#[tokio::test]
async fn matrix_variants_run_with_their_env() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let json = r#"{
        "version": 1,
        "tasks": [
            {"name": "probe", "command": "echo $flavor >> flavors.txt",
             "matrix": {"flavor": ["sweet", "sour"]}}
        ]
    }"#;
    let graph = sykli::load_graph(json).unwrap();

    let exec = Executor::new(
        graph,
        Arc::new(LocalTarget::new(work.path())),
        CacheRepo::at(cache.path()),
        EventBus::new(),
        ExecOptions {
            workdir: work.path().to_path_buf(),
            ..ExecOptions::default()
        },
    );
    let summary = exec.run().await.unwrap();
    assert!(summary.success());
    assert_eq!(summary.outcomes.len(), 2);

    let mut flavors: Vec<String> = std::fs::read_to_string(work.path().join("flavors.txt"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    flavors.sort();
    assert_eq!(flavors, vec!["sour", "sweet"]);
}

#[tokio::test]
async fn retry_then_success_is_passed() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let mut flaky = task(
        "flaky",
        "echo x >> attempts.txt; test $(wc -l < attempts.txt) -ge 2",
        &[],
    );
    flaky.retry = 3;

    let summary = executor(vec![flaky], &work, &cache).run().await.unwrap();
    assert_eq!(summary.outcomes["flaky"].status, TaskStatus::Passed);
    assert_eq!(summary.outcomes["flaky"].attempts, 2);
}
