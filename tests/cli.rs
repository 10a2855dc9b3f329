use std::fs;
use std::process::Command;

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_facerestore"))
        .arg("help")
        .output()
        .expect("run facerestore help");

    assert!(
        output.status.success(),
        "facerestore help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["restore", "export", "build", "inspect"] {
        assert!(stdout.contains(subcommand), "missing {subcommand} in help output");
    }
}

#[test]
fn build_rejects_unknown_precision() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let graph = dir.path().join("model.onnx");
    let engine = dir.path().join("model.engine");
    fs::write(&graph, b"dummy").expect("write dummy graph");

    let output = Command::new(env!("CARGO_BIN_EXE_facerestore"))
        .args(["build", "--precision", "fp8", "-o"])
        .arg(&graph)
        .arg("-e")
        .arg(&engine)
        .output()
        .expect("run facerestore build");

    assert!(!output.status.success(), "build with fp8 should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("fp8"), "error does not name the precision: {stderr}");
    assert!(!engine.exists(), "engine file left behind");
    assert!(!dir.path().join("model.log").exists(), "build log written before precision check");
}

#[test]
fn build_fails_cleanly_on_unreadable_graph() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let graph = dir.path().join("model.onnx");
    let engine = dir.path().join("model.engine");
    fs::write(&graph, b"not a protobuf graph").expect("write dummy graph");

    let output = Command::new(env!("CARGO_BIN_EXE_facerestore"))
        .args(["build", "--precision", "fp32", "-o"])
        .arg(&graph)
        .arg("-e")
        .arg(&engine)
        .output()
        .expect("run facerestore build");

    assert!(!output.status.success(), "build of a garbage graph should fail");
    assert!(!engine.exists(), "engine file left behind");
}

#[test]
fn restore_with_empty_input_fails() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let input = dir.path().join("inputs");
    fs::create_dir_all(&input).expect("create input dir");

    let output = Command::new(env!("CARGO_BIN_EXE_facerestore"))
        .args(["restore", "--aligned", "-i"])
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("results"))
        .output()
        .expect("run facerestore restore");

    assert!(!output.status.success(), "restore of an empty directory should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("contains no images"), "unexpected error: {stderr}");
    assert!(!stderr.contains("GFPGAN"), "models were loaded before the input check: {stderr}");
}
