// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Run configuration.
//!
//! A run is described by one TOML file:
//!
//! ```toml
//! tests_dir = "tests"
//! work_dir = "build"
//! mode = "reuse"
//!
//! [target]
//! arch = "arm"
//! emulator = "qemu-system-arm -M netduino2 -S -gdb tcp::{port} -monitor tcp::{control_port},server,nowait"
//! stack_pointer = 0x20010000
//! observe = { acc = "r0" }
//!
//! [target.build]
//! compiler = "arm-none-eabi-gcc -g -O0 -nostdlib {src} -o {bin}.elf"
//!
//! [oracle]
//! arch = "x86_64"
//! stub = "gdbserver localhost:{port} {bin}"
//! observe = { acc = "rax" }
//!
//! [oracle.build]
//! frontend = "clang -g -O0 -S -emit-llvm {src} -o {ir}"
//! backend = "llc {ir} -o {ir}.s"
//! linker = "gcc -g {ir}.s -o {bin}"
//! ```
//!
//! The configuration value is loaded once and handed to the orchestrator;
//! nothing reads it from global state.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use c2t_common::Arch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    rsp::{RegisterInfo, RegisterLayout},
    C2tError, C2tResult,
};

/// How the emulated device is managed across tests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One device for the whole run, reset in place between tests
    #[default]
    Reuse,
    /// A fresh device and debug stub for every test
    Relaunch,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse => write!(f, "reuse"),
            Self::Relaunch => write!(f, "relaunch"),
        }
    }
}

/// One build stage: its name and command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// `compiler`, `frontend`, `backend` or `linker`
    pub name: &'static str,
    /// Shell command with `{src}`, `{ir}` and `{bin}` placeholders
    pub template: String,
}

/// Build stages of one toolchain.
///
/// Either `compiler` alone or `frontend` and `backend` together, each
/// optionally followed by `linker`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPipeline {
    /// Single-step compiler
    pub compiler: Option<String>,
    /// Source to intermediate representation
    pub frontend: Option<String>,
    /// Intermediate representation to object or assembly
    pub backend: Option<String>,
    /// Final link step
    pub linker: Option<String>,
}

impl BuildPipeline {
    /// Stages in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        [
            ("compiler", &self.compiler),
            ("frontend", &self.frontend),
            ("backend", &self.backend),
            ("linker", &self.linker),
        ]
        .into_iter()
        .filter_map(|(name, template)| {
            template.as_ref().map(|t| Stage { name, template: t.clone() })
        })
        .collect()
    }

    /// File extension of the produced binary: whatever follows `-o {bin}` in
    /// the final stage, e.g. `.elf`. Empty when the binary has none.
    pub fn binary_extension(&self) -> String {
        let Some(last) = self.stages().pop() else {
            return String::new();
        };
        let Some(at) = last.template.find("-o {bin}") else {
            return String::new();
        };
        last.template[at + "-o {bin}".len()..]
            .chars()
            .take_while(|c| !c.is_whitespace())
            .collect()
    }

    fn check(&self, side: &str, problems: &mut Vec<String>) {
        let split = self.frontend.is_some() || self.backend.is_some();
        match (&self.compiler, split) {
            (Some(_), true) => problems.push(format!(
                "[{side}.build]: `compiler` and `frontend`/`backend` are mutually exclusive"
            )),
            (None, false) => problems.push(format!(
                "[{side}.build]: set either `compiler` or `frontend` and `backend`"
            )),
            (None, true) if self.frontend.is_none() || self.backend.is_none() => problems
                .push(format!("[{side}.build]: `frontend` and `backend` must be set together")),
            _ => {}
        }
        let stages = self.stages();
        if let Some(first) = stages.first() {
            if !first.template.contains("{src}") {
                problems.push(format!("[{side}.build]: `{}` does not use {{src}}", first.name));
            }
        }
        if let Some(last) = stages.last() {
            if !last.template.contains("-o {bin}") {
                problems.push(format!(
                    "[{side}.build]: final stage `{}` must write its output with `-o {{bin}}`",
                    last.name
                ));
            }
        }
        if let Some(frontend) = &self.frontend {
            if !frontend.contains("{ir}") {
                problems.push(format!("[{side}.build]: `frontend` does not write {{ir}}"));
            }
        }
    }
}

/// A register given either by name or with an explicit width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterSpec {
    /// Name only, width from `register_bits`
    Name(String),
    /// Name and width in bits
    Sized {
        /// Register name
        name: String,
        /// Width in bits
        bits: u32,
    },
}

/// How a debugger sees one machine: register layout and observed registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Architecture name, also the binary-name suffix
    pub arch: Arch,
    /// Custom register list in `g` packet order, replacing the preset
    #[serde(default)]
    pub registers: Option<Vec<RegisterSpec>>,
    /// Default width of custom registers
    #[serde(default)]
    pub register_bits: Option<u32>,
    /// Byte order override
    #[serde(default)]
    pub little_endian: Option<bool>,
    /// Program counter name override
    #[serde(default)]
    pub pc: Option<String>,
    /// Stack pointer name override
    #[serde(default)]
    pub sp: Option<String>,
    /// DWARF register numbering override (index = DWARF number)
    #[serde(default)]
    pub dwarf_registers: Option<Vec<String>>,
    /// `kind` argument of breakpoint packets
    #[serde(default)]
    pub breakpoint_kind: Option<u32>,
    /// Registers compared between target and oracle, keyed by a shared alias
    #[serde(default)]
    pub observe: BTreeMap<String, String>,
}

impl MachineConfig {
    /// Register layout: the architecture preset or the custom list, with overrides applied.
    pub fn layout(&self) -> C2tResult<RegisterLayout> {
        let mut layout = match &self.registers {
            Some(registers) => {
                let default_bits = self.register_bits.unwrap_or(32);
                let registers = registers
                    .iter()
                    .map(|spec| match spec {
                        RegisterSpec::Name(name) => {
                            RegisterInfo { name: name.clone(), bits: default_bits }
                        }
                        RegisterSpec::Sized { name, bits } => {
                            RegisterInfo { name: name.clone(), bits: *bits }
                        }
                    })
                    .collect();
                RegisterLayout::new(registers, true, "pc", "sp")
            }
            None => RegisterLayout::preset(self.arch.as_str()).ok_or_else(|| {
                C2tError::Config(format!(
                    "unknown architecture `{}` (presets: {}); list its `registers` explicitly",
                    self.arch,
                    RegisterLayout::PRESETS.join(", ")
                ))
            })?,
        };
        if let Some(little_endian) = self.little_endian {
            layout = layout.with_little_endian(little_endian);
        }
        if self.pc.is_some() || self.sp.is_some() {
            let pc = self.pc.clone().unwrap_or_else(|| layout.pc().to_string());
            let sp = self.sp.clone().unwrap_or_else(|| layout.sp().to_string());
            layout = layout.with_roles(pc, sp);
        }
        if let Some(dwarf) = &self.dwarf_registers {
            layout = layout.with_dwarf_names(dwarf.clone());
        }
        if let Some(kind) = self.breakpoint_kind {
            layout = layout.with_breakpoint_kind(kind);
        }
        layout.check().map_err(|e| C2tError::Config(format!("{}: {e}", self.arch)))?;
        Ok(layout)
    }

    fn check(&self, side: &str, problems: &mut Vec<String>) {
        let arch = self.arch.as_str();
        if arch.is_empty() || arch.contains(['/', '\\']) || arch.contains(char::is_whitespace) {
            problems.push(format!("[{side}]: `{arch}` cannot be used as an architecture name"));
        }
        match self.layout() {
            Ok(layout) => {
                for (alias, register) in &self.observe {
                    if layout.index_of(register).is_none() {
                        problems.push(format!(
                            "[{side}]: observed `{alias}` names unknown register `{register}`"
                        ));
                    }
                }
            }
            Err(e) => problems.push(format!("[{side}]: {}", strip_config(&e))),
        }
    }
}

/// The emulated device under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Architecture and registers
    #[serde(flatten)]
    pub machine: MachineConfig,
    /// Emulator command with `{port}` and optionally `{control_port}`
    pub emulator: String,
    /// Symbol execution starts at
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Initial stack pointer; left as the device sets it when absent
    #[serde(default)]
    pub stack_pointer: Option<u64>,
    /// Read uploaded code back and compare it
    #[serde(default = "default_true")]
    pub verify_upload: bool,
    /// Toolchain producing target binaries
    pub build: BuildPipeline,
}

/// The trusted reference running under a native debug stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Architecture and registers
    #[serde(flatten)]
    pub machine: MachineConfig,
    /// Debug stub command with `{port}` and `{bin}`
    pub stub: String,
    /// Toolchain producing oracle binaries
    pub build: BuildPipeline,
}

/// Bounds on every wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Connection attempts before a port is declared dead
    pub port_attempts: u32,
    /// Pause between connection attempts
    pub port_interval_ms: u64,
    /// Wait for a reply to a single request
    pub reply_secs: u64,
    /// Wait for the program to stop after resuming it
    pub run_secs: u64,
    /// Grace period for children to exit on their own before being killed
    pub shutdown_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            port_attempts: 50,
            port_interval_ms: 100,
            reply_secs: 5,
            run_secs: 30,
            shutdown_secs: 2,
        }
    }
}

impl Timeouts {
    /// Pause between connection attempts.
    pub fn port_interval(&self) -> Duration {
        Duration::from_millis(self.port_interval_ms)
    }

    /// Wait for a reply to a single request.
    pub fn reply(&self) -> Duration {
        Duration::from_secs(self.reply_secs)
    }

    /// Wait for the program to stop after resuming it.
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    /// Grace period on teardown.
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

/// The complete description of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct C2tConfig {
    /// Directory holding the annotated test sources
    pub tests_dir: PathBuf,
    /// Directory receiving IR, binaries and child logs
    pub work_dir: PathBuf,
    /// Device management mode
    #[serde(default)]
    pub mode: RunMode,
    /// Only run tests whose name matches this regex
    #[serde(default)]
    pub test_filter: Option<String>,
    /// Device under test
    pub target: TargetConfig,
    /// Reference
    pub oracle: OracleConfig,
    /// Wait bounds
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_entry() -> String {
    "main".into()
}

fn default_true() -> bool {
    true
}

impl C2tConfig {
    /// Load the configuration at `path`; relative directories are resolved
    /// against the directory containing it.
    pub fn load(path: &Path) -> C2tResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            C2tError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_toml(&text, base)
            .map_err(|e| C2tError::Config(format!("{}: {}", path.display(), strip_config(&e))))?;
        debug!(path = %path.display(), target = %config.target.machine.arch, oracle = %config.oracle.machine.arch, "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML text, resolving relative directories against `base`.
    pub fn from_toml(text: &str, base: &Path) -> C2tResult<Self> {
        let mut config: Self = toml::from_str(text).map_err(|e| C2tError::Config(e.to_string()))?;
        if config.tests_dir.is_relative() {
            config.tests_dir = base.join(&config.tests_dir);
        }
        if config.work_dir.is_relative() {
            config.work_dir = base.join(&config.work_dir);
        }
        Ok(config)
    }

    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> C2tResult<()> {
        let mut problems = Vec::new();

        self.target.build.check("target", &mut problems);
        self.oracle.build.check("oracle", &mut problems);
        self.target.machine.check("target", &mut problems);
        self.oracle.machine.check("oracle", &mut problems);

        let target_aliases: BTreeSet<_> = self.target.machine.observe.keys().collect();
        let oracle_aliases: BTreeSet<_> = self.oracle.machine.observe.keys().collect();
        if target_aliases != oracle_aliases {
            problems.push(format!(
                "observed registers differ: target has {target_aliases:?}, oracle has {oracle_aliases:?}"
            ));
        }
        if self.target.machine.arch == self.oracle.machine.arch {
            problems.push(format!(
                "target and oracle share the architecture name `{}`, their binaries would collide",
                self.target.machine.arch
            ));
        }

        if !self.target.emulator.contains("{port}") {
            problems.push("[target]: `emulator` does not use {port}".into());
        }
        if self.mode == RunMode::Reuse && !self.target.emulator.contains("{control_port}") {
            problems.push("[target]: reuse mode needs {control_port} in `emulator`".into());
        }
        for placeholder in ["{port}", "{bin}"] {
            if !self.oracle.stub.contains(placeholder) {
                problems.push(format!("[oracle]: `stub` does not use {placeholder}"));
            }
        }
        if self.target.entry.trim().is_empty() {
            problems.push("[target]: `entry` is empty".into());
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("port_attempts", u64::from(t.port_attempts)),
            ("port_interval_ms", t.port_interval_ms),
            ("reply_secs", t.reply_secs),
            ("run_secs", t.run_secs),
        ] {
            if value == 0 {
                problems.push(format!("[timeouts]: `{name}` must be positive"));
            }
        }

        if let Some(filter) = &self.test_filter {
            if let Err(e) = Regex::new(filter) {
                problems.push(format!("`test_filter` is not a valid regex: {e}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(C2tError::Config(problems.join("\n  ")))
        }
    }
}

/// Substitute `{name}` placeholders in `template`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{name}}}"), value)
    })
}

fn strip_config(err: &C2tError) -> String {
    match err {
        C2tError::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tests_dir = "tests"
work_dir = "/tmp/c2t-work"

[target]
arch = "arm"
emulator = "qemu-system-arm -S -gdb tcp::{port} -monitor tcp::{control_port},server,nowait"
stack_pointer = 0x20010000
observe = { acc = "r0" }

[target.build]
compiler = "arm-none-eabi-gcc -g -O0 {src} -o {bin}.elf"

[oracle]
arch = "x86_64"
stub = "gdbserver localhost:{port} {bin}"
observe = { acc = "rax" }

[oracle.build]
frontend = "clang -g -S -emit-llvm {src} -o {ir}"
backend = "llc {ir} -o {ir}.s"
linker = "gcc -g {ir}.s -o {bin}"

[timeouts]
port_attempts = 3
"#;

    fn sample() -> C2tConfig {
        C2tConfig::from_toml(SAMPLE, Path::new("/etc/c2t")).unwrap()
    }

    #[test]
    fn test_parse_and_resolve_paths() {
        let config = sample();
        assert_eq!(config.tests_dir, PathBuf::from("/etc/c2t/tests"));
        assert_eq!(config.work_dir, PathBuf::from("/tmp/c2t-work"));
        assert_eq!(config.mode, RunMode::Reuse);
        assert_eq!(config.target.entry, "main");
        assert!(config.target.verify_upload);
        assert_eq!(config.target.stack_pointer, Some(0x2001_0000));
        assert_eq!(config.timeouts.port_attempts, 3);
        assert_eq!(config.timeouts.reply_secs, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_pipeline_stages_and_extension() {
        let config = sample();
        let target: Vec<_> = config.target.build.stages().iter().map(|s| s.name).collect();
        assert_eq!(target, ["compiler"]);
        assert_eq!(config.target.build.binary_extension(), ".elf");

        let oracle: Vec<_> = config.oracle.build.stages().iter().map(|s| s.name).collect();
        assert_eq!(oracle, ["frontend", "backend", "linker"]);
        assert_eq!(config.oracle.build.binary_extension(), "");
    }

    #[test]
    fn test_compiler_and_frontend_are_exclusive() {
        let mut config = sample();
        config.target.build.frontend = Some("clang {src} -o {ir}".into());
        config.target.build.backend = Some("llc {ir} -o {bin}".into());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("mutually exclusive"), "{err}");

        config.target.build = BuildPipeline::default();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("set either `compiler`"), "{err}");
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = sample();
        config.oracle.stub = "gdbserver :1234".into();
        config.oracle.machine.observe.insert("acc".into(), "r99".into());
        config.timeouts.run_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("does not use {port}"), "{err}");
        assert!(err.contains("does not use {bin}"), "{err}");
        assert!(err.contains("unknown register `r99`"), "{err}");
        assert!(err.contains("`run_secs` must be positive"), "{err}");
    }

    #[test]
    fn test_custom_register_layout() {
        let machine = MachineConfig {
            arch: Arch::from("toy"),
            registers: Some(vec![
                RegisterSpec::Name("r0".into()),
                RegisterSpec::Name("sp".into()),
                RegisterSpec::Sized { name: "pc".into(), bits: 32 },
                RegisterSpec::Sized { name: "flags".into(), bits: 8 },
            ]),
            register_bits: Some(32),
            little_endian: Some(false),
            ..Default::default()
        };
        let layout = machine.layout().unwrap();
        assert!(!layout.little_endian());
        assert_eq!(layout.index_of("flags"), Some(3));
        assert_eq!(layout.registers()[3].bits, 8);

        let unknown = MachineConfig { arch: Arch::from("toy"), ..Default::default() };
        assert!(unknown.layout().unwrap_err().to_string().contains("unknown architecture"));
    }

    #[test]
    fn test_render_placeholders() {
        let text = render("cc {src} -o {bin}.elf {src}", &[("src", "a.c"), ("bin", "out/a_arm")]);
        assert_eq!(text, "cc a.c -o out/a_arm.elf a.c");
        assert_eq!(render("qemu -gdb tcp::{port}", &[]), "qemu -gdb tcp::{port}");
    }
}
