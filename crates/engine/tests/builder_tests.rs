use std::{fs, path::Path, time::Duration};

use c2t_common::{logging::ensure_test_logging, Arch, TestCase};
use c2t_engine::{
    builder::{Builder, READ_AHEAD},
    config::BuildPipeline,
    C2tError,
};

/// Stand-in backend with a compiler's command line: `<in> -o <out>`.
const COPY: &str = "sh -c 'cp \"$0\" \"$2\"'";

/// Whether `pid` is still running (zombies count as gone).
fn running(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat.rsplit_once(") ").is_some_and(|(_, rest)| !rest.starts_with('Z')),
        Err(_) => false,
    }
}

fn write_tests(dir: &Path, names: &[&str]) -> Vec<TestCase> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(format!("{name}.c"));
            fs::write(&path, format!("int {name};\n")).unwrap();
            TestCase::from_path(path).unwrap()
        })
        .collect()
}

fn built(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_two_stage_pipeline_substitutes_paths() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["add"]);
    let pipeline = BuildPipeline {
        frontend: Some("cp {src} {ir}".into()),
        backend: Some(format!("{COPY} {{ir}} -o {{bin}}.elf")),
        ..Default::default()
    };
    assert_eq!(pipeline.binary_extension(), ".elf");
    let builder = Builder::new(Arch::from("riscv32"), pipeline, &dir.path().join("work"));

    let artifact = builder.build(&tests[0]).await.unwrap();
    assert_eq!(artifact.path, dir.path().join("work/riscv32/add_riscv32.elf"));
    assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "int add;\n");
    assert!(dir.path().join("work/riscv32/add_riscv32_ir").exists());
}

#[tokio::test]
async fn test_failed_stage_reports_stderr() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["broken"]);
    let pipeline = BuildPipeline {
        compiler: Some("echo 'broken.c:3: error: expected ;' >&2; exit 1".into()),
        ..Default::default()
    };
    let builder = Builder::new(Arch::from("arm"), pipeline, dir.path());

    let err = builder.build(&tests[0]).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    match err {
        C2tError::Build { test, stage, stderr, .. } => {
            assert_eq!(test, "broken");
            assert_eq!(stage, "compiler");
            assert!(stderr.contains("expected ;"));
        }
        other => panic!("expected a build failure, got {other}"),
    }
}

#[tokio::test]
async fn test_missing_output_is_a_build_failure() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["quiet"]);
    let pipeline = BuildPipeline { compiler: Some("true {src}".into()), ..Default::default() };
    let builder = Builder::new(Arch::from("arm"), pipeline, dir.path());

    let err = builder.build(&tests[0]).await.unwrap_err();
    assert!(matches!(err, C2tError::Build { ref stage, .. } if stage == "output"), "{err}");
}

#[tokio::test]
async fn test_builds_run_at_most_read_ahead_in_front() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["t1", "t2", "t3", "t4", "t5"]);
    let pipeline = BuildPipeline { compiler: Some("cp {src} {bin}".into()), ..Default::default() };
    let builder = Builder::new(Arch::from("arm"), pipeline, &dir.path().join("work"));
    let out_dir = builder.out_dir().to_path_buf();

    let (mut queue, handle) = builder.spawn(tests.clone());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(built(&out_dir), READ_AHEAD);

    let mut order = Vec::new();
    while let Some(artifact) = queue.recv().await {
        order.push(artifact.unwrap().test);
    }
    assert_eq!(order, tests);
    assert_eq!(built(&out_dir), 5);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_builder_stops_after_first_failure() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["ok", "bad", "never"]);
    let pipeline = BuildPipeline {
        compiler: Some("case {src} in *bad.c) exit 1;; esac; cp {src} {bin}".into()),
        ..Default::default()
    };
    let (mut queue, handle) =
        Builder::new(Arch::from("arm"), pipeline, dir.path()).spawn(tests);

    assert!(queue.recv().await.unwrap().is_ok());
    assert!(matches!(queue.recv().await.unwrap(), Err(C2tError::Build { .. })));
    assert!(queue.recv().await.is_none());
    handle.await.unwrap();
}

#[tokio::test]
async fn test_aborted_builder_kills_stage_processes() {
    ensure_test_logging(None);
    let dir = tempfile::tempdir().unwrap();
    let tests = write_tests(dir.path(), &["slow"]);
    // The stage's tool runs in the background of its shell
    let pipeline = BuildPipeline {
        compiler: Some("sleep 37 & echo $! > {bin}.pid; wait; cp {src} {bin}".into()),
        ..Default::default()
    };
    let builder = Builder::new(Arch::from("arm"), pipeline, &dir.path().join("work"));
    let pid_file = builder.out_dir().join("slow_arm.pid");

    let (_queue, handle) = builder.spawn(tests);
    let mut pid = None;
    for _ in 0..100 {
        if let Some(found) = fs::read_to_string(&pid_file).ok().and_then(|t| t.trim().parse().ok()) {
            pid = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pid: u32 = pid.expect("the stage never started");
    assert!(running(pid));

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    for _ in 0..100 {
        if !running(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!running(pid), "stage process {pid} outlived the aborted build");
}
