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

//! Debug session runtime.
//!
//! A [`DebugSession`] drives one program under one remote-serial debug stub:
//! it installs the breakpoints of a test, runs the program from hit to hit
//! and sends a [`Dump`] for every hit to the comparator. The target flavour
//! also uploads the program into the emulated device before running it.
//!
//! Lifecycle: [`connect`](DebugSession::connect) →
//! [`load`](DebugSession::load) → [`run`](DebugSession::run) →
//! [`finish`](DebugSession::finish), then either drop the session or
//! [`reset`](DebugSession::reset) it and load the next program.

mod breakpoints;
mod state;

pub use state::{transition, SessionEvent, SessionState};

use std::{collections::BTreeMap, time::Duration};

use c2t_common::{Artifact, BreakpointSpec, Dump, DumpEvent};
use tokio::{net::TcpStream, sync::mpsc};
use tracing::{debug, info, warn};

use self::breakpoints::{BreakpointTable, Capture, HitPlan};
use crate::{
    config::Timeouts,
    image::{FrameBase, ProgramImage, VariableInfo, VariableLocation, UPLOAD_SECTIONS},
    rsp::{RegisterFile, RegisterLayout, RspClient, StopReason},
    C2tError, C2tResult,
};

/// How the target program is started after upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetBoot {
    /// Symbol execution starts at
    pub entry: String,
    /// Initial stack pointer, if one must be set
    pub stack_pointer: Option<u64>,
    /// Read `.text` back after upload
    pub verify_upload: bool,
}

/// Which side of the comparison a session drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// Emulated device; the program is uploaded by the session
    Target(TargetBoot),
    /// Native debug stub that already loaded the program
    Oracle,
}

impl SessionKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Target(_) => "target",
            Self::Oracle => "oracle",
        }
    }
}

/// One live debug connection and the program loaded into it.
#[derive(Debug)]
pub struct DebugSession {
    kind: SessionKind,
    layout: RegisterLayout,
    observe: BTreeMap<String, String>,
    run_timeout: Duration,
    reply_timeout: Duration,
    client: RspClient,
    state: SessionState,
    image: Option<Box<dyn ProgramImage>>,
    table: BreakpointTable,
    test: String,
    exited: bool,
}

impl DebugSession {
    /// Take over an established connection to a debug stub.
    ///
    /// `observe` maps the aliases dumped and compared to register names of
    /// `layout`.
    pub async fn connect(
        kind: SessionKind,
        layout: RegisterLayout,
        observe: BTreeMap<String, String>,
        stream: TcpStream,
        timeouts: &Timeouts,
    ) -> C2tResult<Self> {
        let client = RspClient::new(stream, timeouts.reply());
        let mut session = Self {
            kind,
            layout,
            observe,
            run_timeout: timeouts.run(),
            reply_timeout: timeouts.reply(),
            client,
            state: SessionState::Idle,
            image: None,
            table: BreakpointTable::default(),
            test: String::new(),
            exited: false,
        };
        let features = session.client.supported().await?;
        debug!(side = session.side(), peer = session.client.peer(), %features, "Stub features");
        let reason = session.client.halt_reason().await?;
        let registers = session.read_registers().await?;
        let pc = registers.require(session.layout.pc())?;
        info!(side = session.side(), peer = session.client.peer(), ?reason, pc = format_args!("{pc:#x}"), "Connected to debug stub");
        session.advance(SessionEvent::Connect)?;
        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn side(&self) -> &'static str {
        self.kind.label()
    }

    fn advance(&mut self, event: SessionEvent) -> C2tResult<()> {
        self.state = transition(self.state, event)?;
        Ok(())
    }

    async fn read_registers(&mut self) -> C2tResult<RegisterFile> {
        let payload = self.client.read_registers().await?;
        self.layout.decode(&payload)
    }

    async fn write_register(&mut self, name: &str, value: u64) -> C2tResult<()> {
        let index = self
            .layout
            .index_of(name)
            .ok_or_else(|| C2tError::protocol(format!("no register `{name}` in layout")))?;
        let hex = self.layout.encode(index, value)?;
        self.client.write_register(index, &hex).await
    }

    /// Prepare `artifact` for running: upload it (target only), then install
    /// the breakpoints of `specs`.
    pub async fn load(
        &mut self,
        artifact: &Artifact,
        image: Box<dyn ProgramImage>,
        specs: &[BreakpointSpec],
    ) -> C2tResult<()> {
        if self.state != SessionState::Connected {
            return Err(C2tError::protocol(format!(
                "cannot load {} while {}",
                artifact.test, self.state
            )));
        }
        self.test = artifact.test.name().to_string();
        if let SessionKind::Target(boot) = &self.kind {
            let boot = boot.clone();
            self.upload(image.as_ref(), &boot).await?;
        }

        let mut table = BreakpointTable::resolve(specs, image.as_ref())?;
        let kind = self.layout.breakpoint_kind();
        for address in table.addresses() {
            self.client.insert_breakpoint(address, kind).await?;
            table.mark_installed(address);
        }
        debug!(side = self.side(), test = %self.test, breakpoints = table.addresses().len(), "Breakpoints armed");
        self.table = table;
        self.image = Some(image);
        self.exited = false;
        self.advance(SessionEvent::Arm)
    }

    async fn upload(&mut self, image: &dyn ProgramImage, boot: &TargetBoot) -> C2tResult<()> {
        for name in UPLOAD_SECTIONS {
            let Some(section) = image.section(name) else {
                continue;
            };
            if section.data.is_empty() {
                continue;
            }
            debug!(
                test = %self.test,
                section = name,
                address = format_args!("{:#x}", section.address),
                size = section.data.len(),
                "Uploading section"
            );
            self.client.write_memory(section.address, &section.data).await?;
        }

        if boot.verify_upload {
            if let Some(text) = image.section(".text") {
                let back = self.client.read_memory(text.address, text.data.len()).await?;
                if let Some((offset, (&expected, &actual))) =
                    text.data.iter().zip(back.iter()).enumerate().find(|(_, (w, r))| w != r)
                {
                    return Err(C2tError::UploadVerify {
                        section: ".text".into(),
                        address: text.address + offset as u64,
                        expected,
                        actual,
                    });
                }
                debug!(test = %self.test, bytes = back.len(), "Upload verified");
            }
        }

        let entry = image.symbol(&boot.entry).ok_or_else(|| {
            C2tError::DebugInfo(format!("entry symbol `{}` not found", boot.entry))
        })?;
        let pc = self.layout.pc().to_string();
        self.write_register(&pc, entry).await?;
        if let Some(stack_pointer) = boot.stack_pointer {
            let sp = self.layout.sp().to_string();
            self.write_register(&sp, stack_pointer).await?;
        }
        Ok(())
    }

    /// Run the loaded program until the measurement ends, sending one dump
    /// per breakpoint hit and [`DumpEvent::End`] when done.
    ///
    /// A program exit ends the stream normally. If the receiver goes away
    /// the run stops early without error.
    pub async fn run(&mut self, dumps: &mpsc::Sender<DumpEvent>) -> C2tResult<()> {
        self.advance(SessionEvent::Resume)?;
        info!(side = self.side(), test = %self.test, "Running");
        let mut stop = self.client.cont(self.run_timeout).await?;
        loop {
            if stop.is_exit() {
                info!(side = self.side(), test = %self.test, ?stop, "Program exited");
                self.exited = true;
                self.advance(SessionEvent::Exit)?;
                let _ = dumps.send(DumpEvent::End).await;
                return Ok(());
            }

            let registers = self.read_registers().await?;
            let pc = registers.require(self.layout.pc())?;
            let Some(plan) = self.table.hit(pc) else {
                let place = match self.image.as_ref().and_then(|image| image.line_at(pc)) {
                    Some(line) => format!("{pc:#x} (line {line})"),
                    None => format!("{pc:#x}"),
                };
                return Err(C2tError::protocol(format!(
                    "{} stopped ({stop:?}) at {place}, where no breakpoint is armed",
                    self.side()
                )));
            };
            self.advance(SessionEvent::Hit)?;

            let dump = self.capture(&plan, pc, &registers).await?;
            debug!(side = self.side(), test = %self.test, %dump, "Breakpoint hit");
            if dumps.send(DumpEvent::Dump(dump)).await.is_err() {
                debug!(side = self.side(), "Dump consumer is gone, stopping");
                return self.advance(SessionEvent::Finish);
            }

            if !plan.keep {
                let kind = self.layout.breakpoint_kind();
                for address in self.table.line_addresses(plan.line).to_vec() {
                    if self.table.mark_removed(address) {
                        self.client.remove_breakpoint(address, kind).await?;
                    }
                }
            }
            if plan.terminal {
                self.advance(SessionEvent::Finish)?;
                let _ = dumps.send(DumpEvent::End).await;
                return Ok(());
            }

            self.advance(SessionEvent::Resume)?;
            stop = if plan.keep {
                self.step_over(pc).await?
            } else {
                self.client.cont(self.run_timeout).await?
            };
        }
    }

    /// Resume from `address` whose breakpoint stays installed.
    async fn step_over(&mut self, address: u64) -> C2tResult<StopReason> {
        let kind = self.layout.breakpoint_kind();
        self.client.remove_breakpoint(address, kind).await?;
        let stop = self.client.step().await?;
        if stop.is_exit() {
            self.table.mark_removed(address);
            return Ok(stop);
        }
        self.client.insert_breakpoint(address, kind).await?;

        let registers = self.read_registers().await?;
        let pc = registers.require(self.layout.pc())?;
        if self.table.is_armed(pc) {
            // The step itself reached a breakpoint
            return Ok(stop);
        }
        self.client.cont(self.run_timeout).await
    }

    async fn capture(&mut self, plan: &HitPlan, pc: u64, registers: &RegisterFile) -> C2tResult<Dump> {
        let mut dump = Dump::new(pc, plan.line);
        for (alias, register) in &self.observe {
            dump = dump.with_register(alias.clone(), registers.require(register)?);
        }

        let Some(image) = self.image.as_ref() else {
            return Err(C2tError::protocol("no program loaded"));
        };
        let little_endian = image.little_endian();
        let wanted: Vec<VariableInfo> = match &plan.capture {
            Capture::All => image.variables().iter().filter(|v| v.visible_at(pc)).cloned().collect(),
            Capture::Named(names) => names
                .iter()
                .filter_map(|name| {
                    let found = image
                        .variables()
                        .iter()
                        .filter(|v| &v.name == name)
                        .find(|v| v.visible_at(pc))
                        .cloned();
                    if found.is_none() {
                        warn!(test = %self.test, line = plan.line, variable = %name, "Variable is not visible here");
                    }
                    found
                })
                .collect(),
        };

        let mut frame_base: Option<Option<FrameBase>> = None;
        for var in wanted {
            let bytes = match var.location {
                VariableLocation::Static(address) => {
                    self.read_scalar_aware(address, &var, little_endian).await?
                }
                VariableLocation::FrameOffset(offset) => {
                    let base = match frame_base {
                        Some(base) => base,
                        None => {
                            let base = self.image_frame_base(pc)?;
                            frame_base = Some(base);
                            base
                        }
                    };
                    let Some(base) = base else {
                        return Err(C2tError::DebugInfo(format!(
                            "`{}` is frame-relative but {pc:#x} has no frame base",
                            var.name
                        )));
                    };
                    let address = self
                        .dwarf_register(registers, base.register)?
                        .wrapping_add_signed(base.offset)
                        .wrapping_add_signed(offset);
                    self.read_scalar_aware(address, &var, little_endian).await?
                }
                VariableLocation::Register(number) => {
                    let value = self.dwarf_register(registers, number)?;
                    let size = usize::try_from(var.size).unwrap_or(8).min(8);
                    value.to_le_bytes()[..size].to_vec()
                }
                VariableLocation::RegisterOffset { register, offset } => {
                    let address = self.dwarf_register(registers, register)?.wrapping_add_signed(offset);
                    self.read_scalar_aware(address, &var, little_endian).await?
                }
            };
            dump = dump.with_variable(var.name, bytes);
        }
        Ok(dump)
    }

    fn image_frame_base(&self, pc: u64) -> C2tResult<Option<FrameBase>> {
        match self.image.as_ref() {
            Some(image) => image.frame_base(pc),
            None => Ok(None),
        }
    }

    fn dwarf_register(&self, registers: &RegisterFile, number: u16) -> C2tResult<u64> {
        let name = self.layout.dwarf_name(number).ok_or_else(|| {
            C2tError::DebugInfo(format!("DWARF register {number} has no name in the layout"))
        })?;
        registers.require(name)
    }

    /// Read a variable from memory; scalars come back little-endian.
    async fn read_scalar_aware(
        &mut self,
        address: u64,
        var: &VariableInfo,
        little_endian: bool,
    ) -> C2tResult<Vec<u8>> {
        let size = usize::try_from(var.size)
            .map_err(|_| C2tError::DebugInfo(format!("`{}` is too large", var.name)))?;
        let mut bytes = self.client.read_memory(address, size).await?;
        if var.scalar && !little_endian {
            bytes.reverse();
        }
        Ok(bytes)
    }

    /// End the session: remove remaining breakpoints, then kill the program
    /// with `terminate` or detach from the device without it.
    ///
    /// A detached session is brought back with [`reattach`](Self::reattach),
    /// so failing to clean up is an error. With `terminate`, cleanup is best
    /// effort.
    pub async fn finish(&mut self, terminate: bool) -> C2tResult<()> {
        self.advance(SessionEvent::Finish)?;
        let installed = self.table.drain_installed();
        // A reused device keeps its breakpoints across an exit and a reset
        if !self.exited || !terminate {
            let kind = self.layout.breakpoint_kind();
            for address in installed {
                if let Err(e) = self.client.remove_breakpoint(address, kind).await {
                    if !terminate {
                        return Err(e);
                    }
                    debug!(side = self.side(), error = %e, "Could not remove breakpoint during teardown");
                    break;
                }
            }
        }
        if !terminate {
            self.client.detach().await?;
        } else if !self.exited {
            if let Err(e) = self.client.kill().await {
                debug!(side = self.side(), error = %e, "Kill request failed");
            }
        }
        debug!(side = self.side(), test = %self.test, "Session finished");
        Ok(())
    }

    /// Attach a finished session to its device again, over a new connection,
    /// once the device was reset. The session is then ready to
    /// [`load`](Self::load) the next program.
    pub async fn reattach(&mut self, stream: TcpStream) -> C2tResult<()> {
        self.advance(SessionEvent::Reset)?;
        self.client = RspClient::new(stream, self.reply_timeout);
        self.table = BreakpointTable::default();
        self.image = None;
        self.exited = false;
        self.client.supported().await?;
        let reason = self.client.halt_reason().await?;
        debug!(side = self.side(), peer = self.client.peer(), ?reason, "Session reattached");
        Ok(())
    }
}
