//! End-to-end dispatch tests: packets in, stepped grids, memory out.

use std::sync::Arc;

use parking_lot::Mutex;

use simt_core::code::{EntryKind, Inst, Opcode, Operand, Segment, TypeKind, VariableDecl};
use simt_core::function::{Executable, FunctionBuilder};
use simt_core::packet::{DispatchPacket, Signal};
use simt_core::{EmuConfig, EmuError, Emulator, GridState, InstOutcome};

fn packet(kernel: u64, grid: [u32; 3], group: [u32; 3]) -> DispatchPacket {
    DispatchPacket {
        dimensions: 3,
        grid_size: grid,
        workgroup_size: group,
        kernel_object: kernel,
        kernarg_address: 0,
        private_segment_size: 256,
        group_segment_size: 1024,
        completion_signal: Signal::new(1),
    }
}

fn ret_entry() -> EntryKind {
    EntryKind::Instruction(Inst::nullary(Opcode::Ret, TypeKind::B1))
}

#[test]
fn grid_partitions_into_work_groups() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(FunctionBuilder::new("&k").entry(ret_entry()).build());
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();

    let packet = packet(kernel, [4, 1, 1], [2, 1, 1]);
    let grid = emulator.launch(Arc::new(executable), &packet).unwrap();

    assert_eq!(grid.num_work_groups(), 2);
    assert_eq!(grid.work_group(0).unwrap().num_work_items(), 2);
    assert_eq!(grid.work_group(1).unwrap().num_work_items(), 2);
    assert_eq!(grid.state(), GridState::Active);
}

#[test]
fn index_space_deflattens_x_fastest() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(
        FunctionBuilder::new("&ids")
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::WorkItemAbsId,
                TypeKind::U32,
            )))
            .entry(ret_entry())
            .build(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();
    let sink = Arc::clone(&seen);
    emulator
        .handlers_mut()
        .register(Opcode::WorkItemAbsId, move |item, _inst, _env| {
            sink.lock().push((
                item.abs_flat_id(),
                [item.abs_id(0), item.abs_id(1), item.abs_id(2)],
            ));
            Ok(InstOutcome::Advance)
        });

    let packet = packet(kernel, [3, 2, 1], [3, 2, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen.len(), 6);
    // Linear index 4 of a (3, 2, 1) grid is (x=1, y=1, z=0).
    assert_eq!(seen[4], (4, [1, 1, 0]));
    assert_eq!(seen[5], (5, [2, 1, 0]));
}

#[test]
fn barrier_separates_phases_across_the_group() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(
        FunctionBuilder::new("&phased")
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Mov,
                TypeKind::U32,
            )))
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Barrier,
                TypeKind::B1,
            )))
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Add,
                TypeKind::U32,
            )))
            .entry(ret_entry())
            .build(),
    );

    let events: Arc<Mutex<Vec<(u64, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut emulator = Emulator::new(EmuConfig::builder().wavefront_size(2).build().unwrap())
        .unwrap();
    let sink = Arc::clone(&events);
    emulator.handlers_mut().register(Opcode::Mov, move |item, _, _| {
        sink.lock().push((item.abs_flat_id(), 1));
        Ok(InstOutcome::Advance)
    });
    let sink = Arc::clone(&events);
    emulator.handlers_mut().register(Opcode::Add, move |item, _, _| {
        sink.lock().push((item.abs_flat_id(), 2));
        Ok(InstOutcome::Advance)
    });

    let packet = packet(kernel, [8, 1, 1], [8, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 16);
    let last_phase1 = events.iter().rposition(|&(_, p)| p == 1).unwrap();
    let first_phase2 = events.iter().position(|&(_, p)| p == 2).unwrap();
    assert!(
        last_phase1 < first_phase2,
        "a lane entered phase 2 before the whole group left phase 1"
    );
}

#[test]
fn trailing_barrier_still_gathers_the_group() {
    let mut executable = Executable::new();
    // Lane 0 branches to the barrier at the very end of the body; the
    // other lane waits at the earlier one and then returns. Entry
    // offsets are 0, 4, 8, 12, 16.
    let kernel = executable.add_function(
        FunctionBuilder::new("&diverge")
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Cmp,
                TypeKind::B1,
            )))
            .entry(EntryKind::Instruction(Inst {
                opcode: Opcode::Cbr,
                ty: TypeKind::B1,
                operands: vec![Operand::Register("$c0".into()), Operand::Label(16)],
            }))
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Barrier,
                TypeKind::B1,
            )))
            .entry(ret_entry())
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Barrier,
                TypeKind::B1,
            )))
            .build(),
    );

    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();
    emulator.handlers_mut().register(Opcode::Cmp, |item, _, _| {
        let lane0 = item.flat_local_id() == 0;
        item.current_frame_mut()?.set_control_register("$c0", lane0)?;
        Ok(InstOutcome::Advance)
    });

    let packet = packet(kernel, [2, 1, 1], [2, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();

    // Bounded stepping: the dispatch must drain without a stall even
    // though one lane's barrier is the last entry of the body.
    for _ in 0..50 {
        if !emulator.tick(&mut grid).unwrap() {
            break;
        }
    }
    assert_eq!(grid.state(), GridState::Done);
    assert_eq!(packet.completion_signal.value(), 0);
}

#[test]
fn failing_lane_is_reachable_for_a_backtrace() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(
        FunctionBuilder::new("&crashy")
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Mad,
                TypeKind::U32,
            )))
            .build(),
    );
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();

    let packet = packet(kernel, [2, 1, 1], [2, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    let err = emulator.tick(&mut grid).unwrap_err();
    assert!(matches!(err, EmuError::UnimplementedOpcode(Opcode::Mad)));

    // Walk down to the lanes and render where each of them stopped.
    let traces: Vec<String> = grid
        .work_groups()
        .flat_map(|group| group.wavefronts())
        .flat_map(|wave| wave.work_items())
        .map(|item| item.backtrace(&emulator.context().memory))
        .collect();
    assert_eq!(traces.len(), 2);
    assert!(traces.iter().all(|trace| trace.contains("&crashy")));
}

#[test]
fn call_copies_arguments_both_ways() {
    let mut executable = Executable::new();

    // Callee: reads its input formal, writes input + 1 to its output
    // formal. No trailing ret: the cursor running past the body must
    // unwind as an implicit return.
    executable.add_function(
        FunctionBuilder::new("&inc")
            .input_arg("%a", TypeKind::U32, 1)
            .output_arg("%r", TypeKind::U64, 1)
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Cvt,
                TypeKind::U64,
            )))
            .build(),
    );

    let kernel = executable.add_function(
        FunctionBuilder::new("&caller")
            .entry(EntryKind::ArgBlockStart)
            .entry(EntryKind::Variable(VariableDecl {
                name: "%in".into(),
                ty: TypeKind::U32,
                dim: 0,
                segment: Segment::Arg,
            }))
            .entry(EntryKind::Variable(VariableDecl {
                name: "%out".into(),
                ty: TypeKind::U64,
                dim: 0,
                segment: Segment::Arg,
            }))
            // Stage the actual input.
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::St,
                TypeKind::U32,
            )))
            .entry(EntryKind::Instruction(Inst {
                opcode: Opcode::Call,
                ty: TypeKind::B1,
                operands: vec![
                    Operand::FunctionRef("&inc".into()),
                    Operand::ArgList(vec!["%out".into()]),
                    Operand::ArgList(vec!["%in".into()]),
                ],
            }))
            // Read the returned output.
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Ld,
                TypeKind::U64,
            )))
            .entry(EntryKind::ArgBlockEnd)
            .entry(ret_entry())
            .build(),
    );

    let result: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();

    emulator.handlers_mut().register(Opcode::St, |item, _, env| {
        let (address, size) = item.variable_buffer(env, Segment::Arg, "%in")?;
        assert_eq!(size, 4);
        env.ctx.memory.write_u32(address, 41)?;
        Ok(InstOutcome::Advance)
    });
    emulator.handlers_mut().register(Opcode::Cvt, |item, _, env| {
        let (src, _) = item.variable_buffer(env, Segment::Arg, "%a")?;
        let (dst, _) = item.variable_buffer(env, Segment::Arg, "%r")?;
        let value = env.ctx.memory.read_u32(src)? as u64 + 1;
        env.ctx.memory.write(dst, &value.to_le_bytes())?;
        Ok(InstOutcome::Advance)
    });
    let sink = Arc::clone(&result);
    emulator.handlers_mut().register(Opcode::Ld, move |item, _, env| {
        let (address, size) = item.variable_buffer(env, Segment::Arg, "%out")?;
        assert_eq!(size, 8);
        let mut buf = [0u8; 8];
        env.ctx.memory.read(address, &mut buf)?;
        *sink.lock() = u64::from_le_bytes(buf);
        Ok(InstOutcome::Advance)
    });

    let packet = packet(kernel, [1, 1, 1], [1, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();

    assert_eq!(*result.lock(), 42);
    assert!(emulator.context().instructions_retired() >= 4);
}

#[test]
fn kernarg_image_is_staged_per_dispatch() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(
        FunctionBuilder::new("&scale")
            .input_arg("%n", TypeKind::U32, 1)
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Ld,
                TypeKind::U32,
            )))
            .entry(ret_entry())
            .build(),
    );

    let observed: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();
    let sink = Arc::clone(&observed);
    emulator.handlers_mut().register(Opcode::Ld, move |item, _, env| {
        let (address, _) = item.variable_buffer(env, Segment::Kernarg, "%n")?;
        *sink.lock() = env.ctx.memory.read_u32(address)?;
        Ok(InstOutcome::Advance)
    });

    // Host side: stage the argument image in flat memory.
    let kernarg_address = emulator.context_mut().memory.allocate(8).unwrap();
    emulator
        .context_mut()
        .memory
        .write_u32(kernarg_address, 0xabad_1dea)
        .unwrap();

    let mut packet = packet(kernel, [1, 1, 1], [1, 1, 1]);
    packet.kernarg_address = kernarg_address;
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();

    assert_eq!(*observed.lock(), 0xabad_1dea);
}

#[test]
fn completion_signal_fires_exactly_once() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(FunctionBuilder::new("&k").entry(ret_entry()).build());
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();

    let packet = packet(kernel, [4, 1, 1], [2, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();

    assert_eq!(grid.state(), GridState::Done);
    assert_eq!(packet.completion_signal.value(), 0);

    // Ticking a drained grid neither errors nor re-signals.
    assert!(!emulator.tick(&mut grid).unwrap());
    assert_eq!(packet.completion_signal.value(), 0);
}

#[test]
fn nested_argument_block_is_a_protocol_violation() {
    let mut executable = Executable::new();
    let kernel = executable.add_function(
        FunctionBuilder::new("&broken")
            .entry(EntryKind::ArgBlockStart)
            .entry(EntryKind::ArgBlockStart)
            .entry(ret_entry())
            .build(),
    );
    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();

    let packet = packet(kernel, [1, 1, 1], [1, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    assert!(matches!(
        emulator.run(&mut grid),
        Err(EmuError::ProtocolViolation(_))
    ));
}

#[test]
fn branch_skips_over_code() {
    let mut executable = Executable::new();
    // Entry offsets are 0, 4, 8: branch from 0 to 8, skipping the Mov.
    let kernel = executable.add_function(
        FunctionBuilder::new("&skip")
            .entry(EntryKind::Instruction(Inst {
                opcode: Opcode::Br,
                ty: TypeKind::B1,
                operands: vec![Operand::Label(8)],
            }))
            .entry(EntryKind::Instruction(Inst::nullary(
                Opcode::Mov,
                TypeKind::U32,
            )))
            .entry(ret_entry())
            .build(),
    );

    let mut emulator = Emulator::new(EmuConfig::default()).unwrap();
    emulator.handlers_mut().register(Opcode::Mov, |_, _, _| {
        panic!("branched-over instruction executed");
    });

    let packet = packet(kernel, [2, 1, 1], [2, 1, 1]);
    let mut grid = emulator.launch(Arc::new(executable), &packet).unwrap();
    emulator.run(&mut grid).unwrap();
    assert_eq!(grid.state(), GridState::Done);
}
