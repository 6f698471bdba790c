use super::*;
use crate::dma::COMMIT_LOG_DEPTH;
use crate::ncr::layout::ccb;
use crate::ncr::{CommandResult, MAX_TAGS};
use crate::scsi::*;
use chip::Fault;
use target::{Agreement, SimBehavior, SimCaps, VENDOR_READ, VENDOR_WRITE, sense_data};

fn harness_with(config: AdapterConfig, ids: &[u8]) -> SimHarness {
    let mut h = SimHarness::new(config).unwrap();
    for &id in ids {
        h.attach_target(SimTarget::new(id)).unwrap();
    }
    h
}

fn harness(ids: &[u8]) -> SimHarness {
    harness_with(AdapterConfig::default(), ids)
}

/// Submits and waits for the completion of one command
fn run(h: &mut SimHarness, cmd: ScsiCommand) -> Completion {
    let id = cmd.id;
    h.submit(cmd).unwrap();
    let mut done = h.settle(60_000).unwrap();
    let pos = done
        .iter()
        .position(|c| c.id == id)
        .unwrap_or_else(|| panic!("{} did not complete", id));
    done.swap_remove(pos)
}

fn read(h: &mut SimHarness, target: u8, lba: u32, blocks: u16) -> (ScsiCommand, DataSegment) {
    let buf = h.alloc_buffer(usize::from(blocks) * 512).unwrap();
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, target, 0, Cdb::read_10(lba, blocks)).with_segments(vec![buf]);
    (cmd, buf)
}

fn tur(h: &mut SimHarness, target: u8) -> ScsiCommand {
    let id = h.next_id();
    ScsiCommand::new(id, target, 0, Cdb::test_unit_ready())
}

fn inquiry(h: &mut SimHarness, target: u8) {
    let buf = h.alloc_buffer(36).unwrap();
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, target, 0, Cdb::inquiry(36)).with_segments(vec![buf]);
    let c = run(h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.transferred, 36);
}

/// INQUIRY followed by the commands carrying WDTR and SDTR
fn negotiate(h: &mut SimHarness, target: u8) {
    inquiry(h, target);
    for _ in 0..2 {
        let cmd = tur(h, target);
        assert_eq!(run(h, cmd).result, CommandResult::Ok);
    }
}

#[test]
fn read_and_write() {
    let mut h = harness(&[1]);
    let (cmd, buf) = read(&mut h, 1, 4, 2);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.transferred, 1024);
    assert_eq!(c.residual, 0);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(1).unwrap().pattern(4, 1024));

    let buf = h.alloc_buffer(512).unwrap();
    let data = (0..512).map(|i| (i * 7) as u8).collect::<Vec<_>>();
    h.fill_buffer(buf, &data).unwrap();
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 1, 0, Cdb::write_10(9, 1)).with_segments(vec![buf]);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(h.target(1).unwrap().writes(), [(9, data)]);

    assert_eq!(h.adapter().active_len(), 0);
    assert_eq!(h.adapter().profile().num_trans, 2);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn scattered_read() {
    let mut h = harness(&[2]);
    let segs = (0..4)
        .map(|_| h.alloc_buffer(256).unwrap())
        .collect::<Vec<_>>();
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 2, 0, Cdb::read_10(1, 2)).with_segments(segs.clone());
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    let data = segs
        .iter()
        .flat_map(|&s| h.read_buffer(s).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(data, h.target(2).unwrap().pattern(1, 1024));
}

#[test]
fn doorbell_follows_ccb_commits() {
    let mut h = harness(&[3]);
    h.target_mut(3)
        .unwrap()
        .push_behavior(SimBehavior::Disconnect { hold: 50 });
    let (cmd, _) = read(&mut h, 3, 0, 1);
    let id = cmd.id;
    h.submit(cmd).unwrap();

    let a = h.adapter();
    let idx = a.ccbs.find_command(id).unwrap();
    let phys = a.ccbs[idx].phys;
    let size = ccb::block_size(a.script().max_scatter()) as u32;
    let ring = h.chip().doorbell_stamps()[0];
    let ccb_commits = a
        .memory()
        .commits()
        .filter(|c| c.addr >= phys && c.addr < phys + size)
        .collect::<Vec<_>>();
    assert!(!ccb_commits.is_empty());
    assert!(ccb_commits.iter().all(|c| c.seq < ring));
    let slot = a.script().slot_operand(0);
    assert!(
        a.memory()
            .commits()
            .any(|c| c.addr == slot && c.seq < ring)
    );

    let done = h.settle(1000).unwrap();
    assert_eq!(done[0].result, CommandResult::Ok);
}

#[test]
fn idle_adapter_keeps_commit_log_bounded() {
    let mut h = harness(&[1]);
    h.advance(300_000).unwrap();
    let commits = h.adapter().memory().commits().count();
    assert!(commits > 0 && commits <= COMMIT_LOG_DEPTH, "{} commits", commits);
}

#[test]
fn lost_target_times_out_without_reset() {
    let mut h = harness(&[1]);
    h.target_mut(1).unwrap().push_behavior(SimBehavior::Hang);
    let cmd = tur(&mut h, 1).with_timeout(1000);
    let id = cmd.id;
    h.submit(cmd).unwrap();
    assert_eq!(h.target(1).unwrap().disconnected_jobs(), 1);

    let period = h.adapter().config().tick_period;
    let mut done = vec![];
    while done.is_empty() {
        h.advance(period).unwrap();
        done = h.take_completions();
        assert!(h.adapter().now() <= 1000 + period);
    }
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].result, CommandResult::TimedOut);
    assert_eq!(h.adapter().profile().num_reset, 0);
    assert_eq!(h.adapter().profile().num_timeout, 1);

    // still usable afterwards
    let cmd = tur(&mut h, 1);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn connected_command_times_out_within_a_period() {
    let mut h = harness(&[1]);
    h.target_mut(1).unwrap().push_behavior(SimBehavior::Stuck);
    // deadline between two housekeeping passes
    let cmd = tur(&mut h, 1).with_timeout(1050);
    let id = cmd.id;
    h.submit(cmd).unwrap();
    assert!(h.chip().is_connected());

    let period = h.adapter().config().tick_period;
    let mut done = vec![];
    while done.is_empty() {
        h.advance(period).unwrap();
        done = h.take_completions();
        assert!(h.adapter().now() <= 1050 + period);
    }
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].result, CommandResult::TimedOut);
    assert_eq!(h.adapter().profile().num_reset, 1);
    assert!(!h.chip().is_connected());
}

#[test]
fn queue_full_lowers_and_restores_depth() {
    let config = AdapterConfig {
        queue_full_recovery: 2,
        ..Default::default()
    };
    let mut h = harness_with(config, &[2]);
    negotiate(&mut h, 2);
    let credit = h.adapter().lun_credit(2, 0).unwrap();
    assert!(credit.tagged);
    assert_eq!(credit.reqlink, 8);

    h.target_mut(2)
        .unwrap()
        .push_behavior(SimBehavior::Status(STATUS_QUEUE_FULL));
    let cmd = tur(&mut h, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::QueueFull);
    let credit = h.adapter().lun_credit(2, 0).unwrap();
    assert_eq!(credit.reqlink, 7);
    assert_eq!(credit.queue_full_events, 1);

    for _ in 0..2 {
        let cmd = tur(&mut h, 2);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    }
    assert_eq!(h.adapter().lun_credit(2, 0).unwrap().reqlink, 8);
    assert!(
        h.target(2)
            .unwrap()
            .tag_messages()
            .iter()
            .all(|&m| m == MSG_SIMPLE_TAG)
    );
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn queue_full_depth_survives_inquiry() {
    let mut h = harness(&[2]);
    negotiate(&mut h, 2);
    let recovery = h.adapter().config().queue_full_recovery;
    assert_eq!(recovery, 100);

    h.target_mut(2)
        .unwrap()
        .push_behavior(SimBehavior::Status(STATUS_QUEUE_FULL));
    let cmd = tur(&mut h, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::QueueFull);
    assert_eq!(h.adapter().lun_credit(2, 0).unwrap().reqlink, 7);

    // a rescan must not undo the lowered depth
    inquiry(&mut h, 2);
    let credit = h.adapter().lun_credit(2, 0).unwrap();
    assert_eq!((credit.reqlink, credit.num_good), (7, 1));

    for _ in 1..recovery - 1 {
        let cmd = tur(&mut h, 2);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    }
    assert_eq!(h.adapter().lun_credit(2, 0).unwrap().reqlink, 7);
    let cmd = tur(&mut h, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let credit = h.adapter().lun_credit(2, 0).unwrap();
    assert_eq!((credit.reqlink, credit.num_good), (8, 0));
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn selection_timeout_skips_to_next_slot() {
    let mut h = harness(&[1]);
    for _ in 0..3 {
        let cmd = tur(&mut h, 1);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    }

    let cmd = tur(&mut h, 5);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::SelectionTimeout);
    assert_eq!(h.adapter().profile().num_sel_timeout, 1);
    let a = h.adapter();
    assert_eq!(
        a.memory().dev_read_u32(a.ncb().startpos()).unwrap(),
        a.script().tryloop_slot(4)
    );

    let cmd = tur(&mut h, 1);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn reset_completes_everything_once() {
    let mut h = harness(&[1, 2]);
    let mut ids = vec![];
    for t in [1, 2] {
        h.target_mut(t)
            .unwrap()
            .push_behavior(SimBehavior::Disconnect { hold: 10_000 });
        let cmd = tur(&mut h, t);
        ids.push(cmd.id);
        h.submit(cmd).unwrap();
    }
    assert_eq!(h.adapter().active_len(), 2);

    h.reset(ids[0]).unwrap();
    let done = h.take_completions();
    assert_eq!(done.len(), 2);
    for id in &ids {
        let c = done.iter().find(|c| c.id == *id).unwrap();
        assert_eq!(c.result, CommandResult::Reset);
    }
    assert!(h.adapter().is_settling());
    assert_eq!(h.target(1).unwrap().jobs(), 0);
    assert_eq!(h.target(2).unwrap().jobs(), 0);

    // held back until the bus settled
    let cmd = tur(&mut h, 2);
    assert_eq!(h.submit(cmd).unwrap(), Submitted::Deferred);
    let settle = h.adapter().config().settle_delay;
    h.advance(settle).unwrap();
    let done = h.take_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result, CommandResult::Ok);

    // an unknown id still gets exactly one completion
    h.reset(CommandId(999)).unwrap();
    let done = h.take_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, CommandId(999));
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn abort_of_deferred_command() {
    let mut h = harness(&[1]);
    h.reset(CommandId(100)).unwrap();
    h.take_completions();

    let cmd = tur(&mut h, 1);
    let id = cmd.id;
    assert_eq!(h.submit(cmd).unwrap(), Submitted::Deferred);
    assert_eq!(h.abort(id).unwrap(), AbortOutcome::Done);
    let done = h.take_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result, CommandResult::Aborted);
    assert_eq!(h.adapter().waiting_len(), 0);
    assert_eq!(h.abort(id).unwrap(), AbortOutcome::NotFound);
}

#[test]
fn abort_behind_stuck_target() {
    let mut h = harness(&[1, 2]);
    h.target_mut(1).unwrap().push_behavior(SimBehavior::Stuck);
    let stuck = tur(&mut h, 1).with_timeout(2000);
    let stuck_id = stuck.id;
    h.submit(stuck).unwrap();
    assert!(h.chip().is_connected());

    let cmd = tur(&mut h, 2);
    let id = cmd.id;
    h.submit(cmd).unwrap();
    assert_eq!(h.abort(id).unwrap(), AbortOutcome::Pending);
    let period = h.adapter().config().tick_period;
    h.advance(period).unwrap();
    let done = h.take_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].result, CommandResult::Aborted);
    assert_eq!(h.adapter().profile().num_reset, 0);
    // the target behind never saw the command
    assert_eq!(h.target(2).unwrap().stats().commands, 0);

    let done = h.settle(5000).unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, stuck_id);
    assert_eq!(done[0].result, CommandResult::TimedOut);
    assert_eq!(h.adapter().profile().num_reset, 1);
    assert!(!h.chip().is_connected());
}

#[test]
fn phase_mismatch_resumes_after_reselection() {
    let mut h = harness(&[4]);
    let segs = (0..5)
        .map(|_| h.alloc_buffer(4096).unwrap())
        .collect::<Vec<_>>();
    h.target_mut(4)
        .unwrap()
        .push_behavior(SimBehavior::PhaseMismatch {
            at: 2 * 4096 + 4059,
            hold: 50,
        });
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 4, 0, Cdb::read_10(0, 40)).with_segments(segs.clone());
    h.submit(cmd).unwrap();
    assert_eq!(h.adapter().profile().num_break, 1);
    assert_eq!(h.target(4).unwrap().disconnected_jobs(), 1);

    let idx = h.adapter().ccbs.find_command(id).unwrap();
    let phys = h.adapter().ccbs[idx].phys;
    let mem = h.adapter().memory();
    let d = crate::ncr::layout::ResumeDescriptor::read(mem, phys + ccb::RESUME[0]).unwrap();
    assert_eq!(d.remaining, 37);
    assert_eq!(d.addr, segs[2].addr + 4059);
    assert_eq!(mem.read_u32(phys + ccb::SAVEP).unwrap(), phys + ccb::RESUME[0]);

    let done = h.settle(1000).unwrap();
    assert_eq!(done[0].result, CommandResult::Ok);
    assert_eq!(done[0].transferred, 5 * 4096);
    assert_eq!(done[0].residual, 0);
    let data = segs
        .iter()
        .flat_map(|&s| h.read_buffer(s).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(data, h.target(4).unwrap().pattern(0, 5 * 4096));
    assert_eq!(h.target(4).unwrap().stats().reselections, 1);
}

#[test]
fn phase_mismatch_on_write_accounts_for_fifo() {
    let mut h = harness(&[4]);
    let segs = (0..2)
        .map(|_| h.alloc_buffer(1024).unwrap())
        .collect::<Vec<_>>();
    let data = (0..2048).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    h.fill_buffer(segs[0], &data[..1024]).unwrap();
    h.fill_buffer(segs[1], &data[1024..]).unwrap();
    h.target_mut(4)
        .unwrap()
        .push_behavior(SimBehavior::PhaseMismatch { at: 1500, hold: 20 });
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 4, 0, Cdb::write_10(3, 4)).with_segments(segs);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.residual, 0);
    assert_eq!(h.target(4).unwrap().writes(), [(3, data)]);
    assert_eq!(h.adapter().profile().num_break, 1);
}

#[test]
fn wide_then_sync_negotiation() {
    let mut h = harness(&[3]);
    inquiry(&mut h, 3);
    assert_eq!(h.adapter().transfer_params(3).unwrap().width, 0);

    let cmd = tur(&mut h, 3);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.adapter().transfer_params(3).unwrap().width, 1);

    let cmd = tur(&mut h, 3);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let agreed = Agreement {
        period: 25,
        offset: 8,
        width: 1,
    };
    let p = h.adapter().transfer_params(3).unwrap();
    assert_eq!((p.period, p.offset, p.width), (25, 8, 1));
    assert_eq!(h.target(3).unwrap().agreement(), agreed);

    // renegotiating the same limits lands on the same agreement
    for _ in 0..2 {
        h.user_command("setsync 3 25").unwrap();
        let cmd = tur(&mut h, 3);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
        assert_eq!(h.adapter().transfer_params(3).unwrap(), p);
        assert_eq!(h.target(3).unwrap().agreement(), agreed);
    }

    let (cmd, buf) = read(&mut h, 3, 8, 4);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(3).unwrap().pattern(8, 2048));
}

#[test]
fn lowered_limits_are_renegotiated() {
    let mut h = harness(&[3]);
    negotiate(&mut h, 3);
    let p = h.adapter().transfer_params(3).unwrap();
    assert_eq!((p.period, p.offset, p.width), (25, 8, 1));

    h.user_command("setsync 3 0").unwrap();
    let cmd = tur(&mut h, 3);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let p = h.adapter().transfer_params(3).unwrap();
    assert_eq!((p.period, p.offset, p.width), (0, 0, 1));
    assert_eq!(
        h.target(3).unwrap().agreement(),
        Agreement {
            period: 0,
            offset: 0,
            width: 1,
        }
    );

    h.user_command("setwide 3 0").unwrap();
    let cmd = tur(&mut h, 3);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let p = h.adapter().transfer_params(3).unwrap();
    assert_eq!((p.period, p.offset, p.width), (0, 0, 0));
    assert_eq!(h.target(3).unwrap().agreement(), Agreement::default());

    // data still moves on the narrow asynchronous bus
    let (cmd, buf) = read(&mut h, 3, 8, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(3).unwrap().pattern(8, 1024));
}

#[test]
fn target_initiated_sync_is_clamped() {
    let mut h = harness(&[4]);
    negotiate(&mut h, 4);
    h.target_mut(4)
        .unwrap()
        .push_behavior(SimBehavior::InitiateSync {
            period: 10,
            offset: 31,
        });
    let cmd = tur(&mut h, 4);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let p = h.adapter().transfer_params(4).unwrap();
    assert_eq!((p.period, p.offset, p.width), (12, 16, 1));
    assert_eq!(
        h.target(4).unwrap().agreement(),
        Agreement {
            period: 12,
            offset: 16,
            width: 1
        }
    );
}

#[test]
fn target_initiated_wide_without_capability() {
    let config = AdapterConfig {
        wide: false,
        ..Default::default()
    };
    let mut h = harness_with(config, &[5]);
    h.target_mut(5)
        .unwrap()
        .push_behavior(SimBehavior::InitiateWide { width: 1 });
    let cmd = tur(&mut h, 5);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.adapter().transfer_params(5).unwrap().width, 0);
    assert_eq!(h.target(5).unwrap().agreement().width, 0);
}

#[test]
fn negotiation_failures_fall_back_to_defaults() {
    let mut h = harness(&[1, 2, 3, 4]);
    let cases = [
        (1, SimBehavior::RejectNegotiation),
        (2, SimBehavior::IgnoreNegotiation),
        (3, SimBehavior::WrongNegotiationAnswer),
        (4, SimBehavior::MalformedNegotiation),
    ];
    for (t, behavior) in cases {
        inquiry(&mut h, t);
        // both the WDTR and the SDTR go wrong
        for _ in 0..2 {
            h.target_mut(t).unwrap().push_behavior(behavior.clone());
            let cmd = tur(&mut h, t);
            assert_eq!(run(&mut h, cmd).result, CommandResult::Ok, "{:?}", behavior);
        }
        let p = h.adapter().transfer_params(t).unwrap();
        assert_eq!((p.period, p.offset, p.width), (0, 0, 0), "{:?}", behavior);
        assert_eq!(h.target(t).unwrap().agreement(), Agreement::default());

        // nothing left to negotiate
        let (cmd, buf) = read(&mut h, t, 0, 1);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
        assert_eq!(h.read_buffer(buf).unwrap(), h.target(t).unwrap().pattern(0, 512));
    }
    assert_eq!(h.adapter().active_len(), 0);
}

#[test]
fn unknown_message_is_rejected() {
    let mut h = harness(&[6]);
    h.target_mut(6)
        .unwrap()
        .push_behavior(SimBehavior::UnknownMessage);
    let (cmd, buf) = read(&mut h, 6, 2, 1);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(6).unwrap().pattern(2, 512));
}

#[test]
fn autosense_on_check_condition() {
    let mut h = harness(&[5]);
    h.target_mut(5)
        .unwrap()
        .push_behavior(SimBehavior::CheckCondition {
            sense: sense_data(3, 0x11, 0),
        });
    let (cmd, _) = read(&mut h, 5, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::CheckCondition);
    assert_eq!(c.transferred, 0);
    assert_eq!(c.residual, 512);
    let sense = c.sense.unwrap();
    assert_eq!(sense.len(), 18);
    assert_eq!(sense[2] & 0x0F, 3);
    assert_eq!(sense[12], 0x11);

    // unsupported opcodes report ILLEGAL REQUEST
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 5, 0, Cdb::from_slice(&[0x1D, 0, 0, 0, 0, 0]).unwrap());
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::CheckCondition);
    assert_eq!(c.sense.unwrap()[2] & 0x0F, 5);
}

#[test]
fn autosense_restarts_after_preemption() {
    let mut h = harness(&[5, 6]);
    h.target_mut(5)
        .unwrap()
        .push_behavior(SimBehavior::SensePreempted {
            sense: sense_data(6, 0x29, 0),
        });
    let cmd = tur(&mut h, 5);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::CheckCondition);
    assert_eq!(c.sense.unwrap()[12], 0x29);
    assert!(h.adapter().profile().num_sir >= 2);
    let a = h.adapter();
    assert_eq!(a.memory().dev_read_u32(a.ncb().restart_trap()).unwrap(), 0);

    let cmd = tur(&mut h, 6);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn direction_chosen_by_target() {
    let mut h = harness(&[2]);
    let buf = h.alloc_buffer(32).unwrap();
    let id = h.next_id();
    let cdb = Cdb::from_slice(&[VENDOR_READ, 0, 0, 0, 2, 0]).unwrap();
    let c = run(&mut h, ScsiCommand::new(id, 2, 0, cdb).with_segments(vec![buf]));
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.transferred, 32);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(2).unwrap().pattern(0, 32));

    let buf = h.alloc_buffer(48).unwrap();
    let data = vec![0x5A; 48];
    h.fill_buffer(buf, &data).unwrap();
    let id = h.next_id();
    let cdb = Cdb::from_slice(&[VENDOR_WRITE, 0, 0, 0, 3, 0]).unwrap();
    let c = run(&mut h, ScsiCommand::new(id, 2, 0, cdb).with_segments(vec![buf]));
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.residual, 0);
    assert_eq!(h.target(2).unwrap().writes(), [(0, data)]);
}

#[test]
fn residuals() {
    let mut h = harness(&[1]);

    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::Underrun { short: 100 });
    let (cmd, _) = read(&mut h, 1, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!((c.transferred, c.residual), (412, 100));

    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::IgnoreWideResidue);
    let (cmd, _) = read(&mut h, 1, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!((c.transferred, c.residual), (511, 1));

    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::Overrun { extra: 64 });
    let (cmd, buf) = read(&mut h, 1, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::ProtocolError);
    assert_eq!(c.residual, 0);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(1).unwrap().pattern(0, 512));
    assert_eq!(h.adapter().profile().num_reset, 0);
}

#[test]
fn unexpected_disconnect_resets_bus() {
    let mut h = harness(&[1, 2]);
    h.target_mut(2)
        .unwrap()
        .push_behavior(SimBehavior::Disconnect { hold: 5000 });
    let other = tur(&mut h, 2);
    let other_id = other.id;
    h.submit(other).unwrap();

    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::UnexpectedDisconnect { at: 100 });
    let (cmd, _) = read(&mut h, 1, 0, 1);
    let id = cmd.id;
    h.submit(cmd).unwrap();
    let done = h.take_completions();
    assert_eq!(done.len(), 2);
    let culprit = done.iter().find(|c| c.id == id).unwrap();
    assert_eq!(culprit.result, CommandResult::ProtocolError);
    let bystander = done.iter().find(|c| c.id == other_id).unwrap();
    assert_eq!(bystander.result, CommandResult::Reset);
    assert_eq!(h.adapter().profile().num_reset, 1);
    assert!(h.adapter().is_settling());

    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::HandshakeTimeout { at: 0 });
    let (cmd, _) = read(&mut h, 1, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::ProtocolError);
    assert_eq!(h.adapter().profile().num_reset, 2);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn chip_faults_reset_and_recover() {
    for fault in [
        Fault::MasterParity,
        Fault::BusFault,
        Fault::IllegalInstruction,
        Fault::BusModeChange,
        Fault::BusReset,
    ] {
        let mut h = harness(&[1]);
        h.target_mut(1)
            .unwrap()
            .push_behavior(SimBehavior::Disconnect { hold: 5000 });
        let cmd = tur(&mut h, 1);
        h.submit(cmd).unwrap();
        assert_eq!(h.adapter().active_len(), 1);

        h.chip_mut().inject(fault);
        h.advance(h.adapter().config().tick_period).unwrap();
        let done = h.take_completions();
        assert_eq!(done.len(), 1, "{:?}", fault);
        assert_eq!(done[0].result, CommandResult::Reset, "{:?}", fault);
        assert_eq!(h.adapter().profile().num_reset, 1, "{:?}", fault);

        let settle = h.adapter().config().settle_delay;
        h.advance(settle).unwrap();
        let cmd = tur(&mut h, 1);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok, "{:?}", fault);
        h.adapter().verify_invariants().unwrap();
    }
}

#[test]
fn scsi_parity_error_continues() {
    let mut h = harness(&[1]);
    h.chip_mut().inject(Fault::ScsiParity);
    let (cmd, buf) = read(&mut h, 1, 0, 1);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(1).unwrap().pattern(0, 512));
    assert_eq!(h.adapter().profile().num_parity, 1);
    assert_eq!(h.adapter().profile().num_reset, 0);
}

#[test]
fn disconnect_without_save_restarts_transfer() {
    let mut h = harness(&[3]);
    h.target_mut(3)
        .unwrap()
        .push_behavior(SimBehavior::DisconnectWithoutSave { at: 1000, hold: 20 });
    let (cmd, buf) = read(&mut h, 3, 5, 4);
    let c = run(&mut h, cmd);
    assert_eq!(c.result, CommandResult::Ok);
    assert_eq!(c.transferred, 2048);
    assert_eq!(h.read_buffer(buf).unwrap(), h.target(3).unwrap().pattern(5, 2048));

    let buf = h.alloc_buffer(1024).unwrap();
    let data = (0..1024).map(|i| (i / 4) as u8).collect::<Vec<_>>();
    h.fill_buffer(buf, &data).unwrap();
    h.target_mut(3)
        .unwrap()
        .push_behavior(SimBehavior::DisconnectWithoutSave { at: 300, hold: 20 });
    let id = h.next_id();
    let cmd = ScsiCommand::new(id, 3, 0, Cdb::write_10(1, 2)).with_segments(vec![buf]);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert_eq!(h.target(3).unwrap().writes(), [(1, data)]);
}

#[test]
fn tagged_commands_overlap_without_collisions() {
    let mut h = harness(&[6]);
    negotiate(&mut h, 6);

    let mut cmds = vec![];
    for i in 0..8u32 {
        h.target_mut(6)
            .unwrap()
            .push_behavior(SimBehavior::Disconnect {
                hold: 100 - u64::from(i) * 10,
            });
        let (cmd, buf) = read(&mut h, 6, i * 4, 1);
        cmds.push((cmd.id, i * 4, buf));
        assert_eq!(h.submit(cmd).unwrap(), Submitted::Accepted);
    }
    assert_eq!(h.target(6).unwrap().disconnected_jobs(), 8);
    assert_eq!(h.adapter().lun_credit(6, 0).unwrap().active, 8);

    // credit exhausted, the ninth waits
    let (cmd, buf) = read(&mut h, 6, 100, 1);
    let ninth = (cmd.id, 100, buf);
    assert_eq!(h.submit(cmd).unwrap(), Submitted::Deferred);
    cmds.push(ninth);

    let done = h.settle(5000).unwrap();
    assert_eq!(done.len(), 9);
    for (id, lba, buf) in cmds {
        let c = done.iter().find(|c| c.id == id).unwrap();
        assert_eq!(c.result, CommandResult::Ok);
        assert_eq!(h.read_buffer(buf).unwrap(), h.target(6).unwrap().pattern(lba, 512));
    }
    let t = h.target(6).unwrap();
    assert_eq!(t.stats().tag_collisions, 0);
    assert_eq!(t.stats().reselections, 8);
    assert!(t.tag_messages().len() >= 9);
    assert!(h.adapter().lun_credit(6, 0).unwrap().maxtags as usize <= MAX_TAGS);
    h.adapter().verify_invariants().unwrap();
}

#[test]
fn old_command_forces_ordered_tag() {
    let mut h = harness(&[2]);
    negotiate(&mut h, 2);
    h.target_mut(2).unwrap().push_behavior(SimBehavior::Hang);
    let old = tur(&mut h, 2).with_timeout(10_000);
    h.submit(old).unwrap();

    h.advance(7000).unwrap();
    let cmd = tur(&mut h, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    let cmd = tur(&mut h, 2);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);

    let tags = h.target(2).unwrap().tag_messages();
    let n = tags.len();
    assert_eq!(&tags[n - 2..], [MSG_ORDERED_TAG, MSG_SIMPLE_TAG]);
}

#[test]
fn reselection_without_ccb_is_dropped() {
    let mut h = harness(&[1]);
    h.target_mut(1)
        .unwrap()
        .push_behavior(SimBehavior::Disconnect { hold: 300 });
    let cmd = tur(&mut h, 1).with_timeout(100);
    h.submit(cmd).unwrap();
    // the command expires while disconnected, the target comes back later
    let done = h.settle(1000).unwrap();
    assert_eq!(done[0].result, CommandResult::TimedOut);
    h.advance(500).unwrap();
    assert_eq!(h.chip().stats().orphans, 1);
    assert_eq!(h.target(1).unwrap().jobs(), 0);

    let cmd = tur(&mut h, 1);
    assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
    assert!(h.chip().is_idle());
}

#[test]
fn start_queue_wraps() {
    let config = AdapterConfig {
        max_start: 4,
        ..Default::default()
    };
    let mut h = harness_with(config, &[1]);
    for i in 0..10 {
        let (cmd, buf) = read(&mut h, 1, i, 1);
        assert_eq!(run(&mut h, cmd).result, CommandResult::Ok);
        assert_eq!(h.read_buffer(buf).unwrap(), h.target(1).unwrap().pattern(i, 512));
    }
    let a = h.adapter();
    assert_eq!(
        a.memory().dev_read_u32(a.ncb().startpos()).unwrap(),
        a.script().tryloop_slot(10 % 4)
    );
}

#[test]
fn sim_caps_limit_agreement() {
    let mut h = harness(&[]);
    let caps = SimCaps {
        wide: false,
        tagged: false,
        ..Default::default()
    };
    h.attach_target(SimTarget::with_caps(6, caps)).unwrap();
    negotiate(&mut h, 6);
    let p = h.adapter().transfer_params(6).unwrap();
    assert_eq!((p.period, p.offset, p.width), (25, 8, 0));
    assert!(!h.adapter().lun_credit(6, 0).unwrap().tagged);
}
