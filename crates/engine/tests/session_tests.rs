use std::{collections::BTreeMap, net::Ipv4Addr, path::PathBuf};

use c2t_common::{
    logging::ensure_test_logging, Arch, Artifact, BreakpointCommand, BreakpointSpec, Dump,
    DumpEvent, TestCase,
};
use c2t_engine::{
    config::Timeouts,
    image::{VariableInfo, VariableLocation},
    rsp::{RegisterInfo, RegisterLayout},
    session::{DebugSession, SessionKind, SessionState, TargetBoot},
    test_utils::{Insn, MemoryImage, MockStub, Served, REGISTERS},
    C2tError,
};
use tokio::{net::TcpStream, sync::mpsc};

fn layout() -> RegisterLayout {
    let registers =
        REGISTERS.iter().map(|name| RegisterInfo { name: name.to_string(), bits: 32 }).collect();
    RegisterLayout::new(registers, true, "pc", "sp")
}

fn observe() -> BTreeMap<String, String> {
    BTreeMap::from([("acc".to_string(), "r0".to_string())])
}

fn artifact() -> Artifact {
    Artifact {
        test: TestCase::from_path("tests/add.c").unwrap(),
        arch: Arch::from("toy"),
        path: PathBuf::from("add_toy"),
    }
}

fn target() -> SessionKind {
    SessionKind::Target(TargetBoot {
        entry: "main".into(),
        stack_pointer: Some(0xf000),
        verify_upload: true,
    })
}

/// r0 = 0x10 + 0x20, stored to 0x2000.
fn add_program() -> MemoryImage {
    MemoryImage::assemble(
        0x100,
        &[
            (Some(7), Insn::Li(0, 0x10)),
            (None, Insn::Li(1, 0x20)),
            (Some(8), Insn::Add(0, 1)),
            (Some(10), Insn::St(0, 0x2000)),
            (Some(20), Insn::Halt),
        ],
    )
}

type StubHandle = tokio::task::JoinHandle<std::io::Result<Served>>;

async fn connect(kind: SessionKind, stub: MockStub) -> (DebugSession, StubHandle) {
    let (port, handle) = stub.spawn().await.unwrap();
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let session = DebugSession::connect(kind, layout(), observe(), stream, &Timeouts::default())
        .await
        .unwrap();
    (session, handle)
}

async fn run_to_end(session: &mut DebugSession) -> Vec<DumpEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    session.run(&tx).await.unwrap();
    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_target_session_uploads_and_dumps_until_bre() {
    ensure_test_logging(None);
    let stub = MockStub::new();
    let (mut session, handle) = connect(target(), stub.clone()).await;
    assert_eq!(session.state(), SessionState::Connected);

    let specs = [
        BreakpointSpec::new(10, BreakpointCommand::Break),
        BreakpointSpec::new(20, BreakpointCommand::BreakEnd),
    ];
    session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap();
    assert_eq!(session.state(), SessionState::BreakpointsArmed);

    let events = run_to_end(&mut session).await;
    assert_eq!(
        events,
        vec![
            DumpEvent::Dump(Dump::new(0x118, 10).with_register("acc", 0x30)),
            DumpEvent::Dump(Dump::new(0x120, 20).with_register("acc", 0x30)),
            DumpEvent::End,
        ]
    );
    assert_eq!(session.state(), SessionState::Finished);

    session.finish(true).await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), Served::Killed);

    let packets = stub.packets();
    assert!(packets.iter().any(|p| p == "P5=00010000"), "entry written to pc: {packets:?}");
    assert!(packets.iter().any(|p| p == "P4=00f00000"), "stack pointer written: {packets:?}");
    assert!(packets.iter().any(|p| p == "z0,118,4"), "one-shot line retired: {packets:?}");
}

#[tokio::test]
async fn test_cycle_breakpoint_fires_on_every_iteration() {
    ensure_test_logging(None);
    // r2 counts down from 3, adding itself to r0 on each pass
    let program = MemoryImage::assemble(
        0x100,
        &[
            (Some(3), Insn::Li(2, 3)),
            (Some(4), Insn::Add(0, 2)),
            (Some(5), Insn::Djnz(2, 0x108)),
            (Some(6), Insn::Halt),
        ],
    );
    let stub = MockStub::with_program(&program, 0xf000);
    let (mut session, _handle) = connect(SessionKind::Oracle, stub).await;

    let specs = [
        BreakpointSpec::new(4, BreakpointCommand::Cycle),
        BreakpointSpec::new(6, BreakpointCommand::BreakEnd),
    ];
    session.load(&artifact(), Box::new(program), &specs).await.unwrap();
    let events = run_to_end(&mut session).await;

    let acc: Vec<(u32, u64)> = events
        .iter()
        .filter_map(|event| match event {
            DumpEvent::Dump(dump) => Some((dump.line, dump.registers["acc"])),
            DumpEvent::End => None,
        })
        .collect();
    assert_eq!(acc, vec![(4, 0), (4, 3), (4, 5), (6, 6)]);
    assert_eq!(events.last(), Some(&DumpEvent::End));
}

#[tokio::test]
async fn test_variables_are_captured_by_name_and_frame() {
    ensure_test_logging(None);
    let program = MemoryImage::assemble(
        0x100,
        &[
            (Some(7), Insn::Li(0, 0x10)),
            (None, Insn::Li(1, 0x20)),
            (Some(8), Insn::Add(0, 1)),
            (Some(10), Insn::St(0, 0x2000)),
            (None, Insn::St(1, 0xeff0)),
            (Some(20), Insn::Halt),
        ],
    )
    .with_static("c", 0x2000)
    .with_frame_base(4, -0x8)
    .with_variable(VariableInfo {
        name: "b".into(),
        location: VariableLocation::FrameOffset(-0x8),
        size: 4,
        scalar: true,
        scope: Vec::new(),
    });
    let (mut session, _handle) = connect(target(), MockStub::new()).await;

    let specs = [
        BreakpointSpec::new(10, BreakpointCommand::Dump).with_variable("c"),
        BreakpointSpec::new(20, BreakpointCommand::Dump),
        BreakpointSpec::new(20, BreakpointCommand::BreakEnd),
    ];
    session.load(&artifact(), Box::new(program), &specs).await.unwrap();
    let events = run_to_end(&mut session).await;

    assert_eq!(
        events,
        vec![
            DumpEvent::Dump(
                Dump::new(0x118, 10).with_register("acc", 0x30).with_variable("c", [0u8; 4])
            ),
            DumpEvent::Dump(
                Dump::new(0x128, 20)
                    .with_register("acc", 0x30)
                    .with_variable("b", [0x20u8, 0, 0, 0])
                    .with_variable("c", [0x30u8, 0, 0, 0])
            ),
            DumpEvent::End,
        ]
    );
}

#[tokio::test]
async fn test_program_exit_ends_stream() {
    ensure_test_logging(None);
    let (mut session, _handle) = connect(target(), MockStub::new()).await;
    let specs = [BreakpointSpec::new(8, BreakpointCommand::Break)];
    session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap();

    let events = run_to_end(&mut session).await;
    assert_eq!(
        events,
        vec![DumpEvent::Dump(Dump::new(0x110, 8).with_register("acc", 0x10)), DumpEvent::End]
    );
    // The program is gone, finishing must not touch it
    session.finish(true).await.unwrap();
}

#[tokio::test]
async fn test_corrupted_upload_is_detected() {
    ensure_test_logging(None);
    let (mut session, _handle) = connect(target(), MockStub::new().corrupt_upload_at(0x109)).await;
    let specs = [BreakpointSpec::new(20, BreakpointCommand::BreakEnd)];
    let err = session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap_err();
    assert_eq!(err.exit_code(), 4);
    match err {
        C2tError::UploadVerify { address, expected, actual, .. } => {
            assert_eq!(address, 0x109);
            assert_eq!(expected, 1);
            assert_eq!(actual, 0xfe);
        }
        other => panic!("expected an upload failure, got {other}"),
    }
}

#[tokio::test]
async fn test_directive_on_line_without_code() {
    ensure_test_logging(None);
    let (mut session, _handle) = connect(target(), MockStub::new()).await;
    let specs = [BreakpointSpec::new(99, BreakpointCommand::Break)];
    let err = session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap_err();
    assert!(matches!(err, C2tError::DebugInfo(_)), "{err}");
}

#[tokio::test]
async fn test_run_requires_loaded_program() {
    ensure_test_logging(None);
    let (mut session, _handle) = connect(SessionKind::Oracle, MockStub::new()).await;
    let (tx, _rx) = mpsc::channel(1);
    let err = session.run(&tx).await.unwrap_err();
    assert!(matches!(err, C2tError::Protocol(_)), "{err}");
}

#[tokio::test]
async fn test_detached_session_reattaches_after_device_reset() {
    ensure_test_logging(None);
    let stub = MockStub::new();
    let (mut session, first) = connect(target(), stub.clone()).await;
    let specs = [
        BreakpointSpec::new(10, BreakpointCommand::Break),
        BreakpointSpec::new(20, BreakpointCommand::BreakEnd),
    ];
    session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap();
    let events = run_to_end(&mut session).await;
    assert_eq!(events.len(), 3);

    session.finish(false).await.unwrap();
    assert_eq!(first.await.unwrap().unwrap(), Served::Detached);
    assert!(stub.machine().lock().breakpoints.is_empty());

    // Same device, new connection
    stub.reset_machine();
    let (port, _second) = stub.clone().spawn().await.unwrap();
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    session.reattach(stream).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap();
    assert_eq!(run_to_end(&mut session).await, events);
}

#[tokio::test]
async fn test_stop_without_breakpoint_names_the_line() {
    ensure_test_logging(None);
    let stub = MockStub::new();
    let (mut session, _handle) = connect(target(), stub.clone()).await;
    let specs = [BreakpointSpec::new(20, BreakpointCommand::BreakEnd)];
    session.load(&artifact(), Box::new(add_program()), &specs).await.unwrap();
    // Planted behind the session's back, as a stray stub breakpoint would be
    stub.machine().lock().breakpoints.insert(0x110);

    let (tx, _rx) = mpsc::channel(4);
    let err = session.run(&tx).await.unwrap_err();
    assert!(matches!(err, C2tError::Protocol(_)), "{err}");
    assert!(err.to_string().contains("0x110 (line 8)"), "{err}");
}
