use std::fs;

use c2t_common::logging::ensure_test_logging;
use c2t_engine::{
    config::{C2tConfig, RunMode, Timeouts},
    C2tError,
};
use tracing::info;

const CONFIG: &str = r#"
tests_dir = "tests"
work_dir = "out"
mode = "relaunch"
test_filter = "^add"

[target]
arch = "riscv32"
emulator = "qemu-system-riscv32 -M virt -S -gdb tcp::{port}"
stack_pointer = 0x80010000
observe = { acc = "x10" }

[target.build]
frontend = "clang -S -emit-llvm {src} -o {ir}"
backend = "llc {ir} -o {ir}.s"
linker = "riscv32-unknown-elf-gcc {ir}.s -o {bin}.elf"

[oracle]
arch = "x86_64"
stub = "gdbserver :{port} {bin}"
observe = { acc = "rax" }

[oracle.build]
compiler = "gcc -g -O0 {src} -o {bin}"

[timeouts]
run_secs = 60
"#;

#[test]
fn test_load_resolves_paths_against_config_dir() {
    ensure_test_logging(None);
    info!("Running test");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c2t.toml");
    fs::write(&path, CONFIG).unwrap();

    let config = C2tConfig::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.tests_dir, dir.path().join("tests"));
    assert_eq!(config.work_dir, dir.path().join("out"));
    assert_eq!(config.mode, RunMode::Relaunch);
    assert_eq!(config.target.entry, "main");
    assert!(config.target.verify_upload);
    assert_eq!(config.target.stack_pointer, Some(0x8001_0000));
    assert_eq!(config.target.build.binary_extension(), ".elf");
    assert_eq!(config.oracle.build.binary_extension(), "");
    assert_eq!(config.timeouts, Timeouts { run_secs: 60, ..Timeouts::default() });
}

#[test]
fn test_presets_resolve_roles() {
    ensure_test_logging(None);
    info!("Running test");
    let config = C2tConfig::from_toml(CONFIG, std::path::Path::new("/")).unwrap();
    let target = config.target.machine.layout().unwrap();
    assert_eq!(target.pc(), "pc");
    assert_eq!(target.sp(), "x2");
    assert_eq!(target.registers().len(), 33);

    let oracle = config.oracle.machine.layout().unwrap();
    assert_eq!(oracle.pc(), "rip");
    assert_eq!(oracle.breakpoint_kind(), 1);
}

#[test]
fn test_load_errors_name_the_file() {
    ensure_test_logging(None);
    info!("Running test");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, CONFIG.replace("compiler =", "compiler_typo =")).unwrap();

    let err = C2tConfig::load(&path).unwrap_err();
    assert!(matches!(err, C2tError::Config(_)));
    let message = err.to_string();
    assert!(message.contains("broken.toml"), "{message}");
    assert!(message.contains("compiler_typo"), "{message}");
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_unknown_arch_without_registers_is_rejected() {
    ensure_test_logging(None);
    info!("Running test");
    let text = CONFIG.replace("arch = \"riscv32\"", "arch = \"vax\"");
    let config = C2tConfig::from_toml(&text, std::path::Path::new("/")).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("unknown architecture `vax`"), "{err}");
    assert!(err.contains("riscv64"), "{err}");
}
