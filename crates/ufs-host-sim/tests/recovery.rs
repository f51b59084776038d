mod common;

use common::*;
use crossbeam_channel::unbounded;
use std::time::Duration;
use ufs_host_core::{CommandResult, EventKind, HostState, UfsError};
use ufs_host_sim::UicErrorInjection;
use ufs_proto::regs::{CONTROLLER_FATAL_ERROR, DEVICE_FATAL_ERROR};

const SHORT: Duration = Duration::from_millis(100);

#[test]
fn single_timeout_clears_the_slot_without_reset() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    let result = host
        .execute_timeout(&read_cmd(0, 0), SHORT)
        .expect("execute");
    assert_eq!(result, CommandResult::Timeout);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(sim.transfer_doorbell(), 0);
    assert_eq!(host.events().count(EventKind::CommandTimeout), 1);
    assert_eq!(host.stats().timeouts, 1);

    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
    assert_eq!(host.state(), HostState::Operational);
    assert_eq!(host.stats().resets, 0);
}

#[test]
fn repeated_timeouts_escalate_to_reset() {
    let mut config = config();
    config.timeout_escalation_threshold = 2;
    let sim_host = start(config, Default::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    for _ in 0..2 {
        let result = host
            .execute_timeout(&read_cmd(0, 0), SHORT)
            .expect("execute");
        assert_eq!(result, CommandResult::Timeout);
    }
    assert!(wait_recovered(host, 1));
    assert_eq!(host.events().count(EventKind::CommandTimeout), 2);

    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn fatal_error_requeues_in_flight_commands() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    let enables = sim.enables();
    sim.set_stall(true);

    let (tx, rx) = unbounded();
    for lba in 0..2 {
        let tx = tx.clone();
        host.submit(&read_cmd(0, lba), move |result| {
            tx.send(result).expect("send result");
        })
        .expect("submit");
    }
    assert!(sim.wait_stalled(2, WAIT));

    sim.inject_fatal(DEVICE_FATAL_ERROR);
    for _ in 0..2 {
        let result = rx.recv_timeout(WAIT).expect("requeue");
        assert_eq!(result, CommandResult::Requeue);
    }
    assert!(wait_recovered(host, 1));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    let stats = host.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(host.events().count(EventKind::FatalError), 1);
    assert!(host.events().count(EventKind::HostReset) >= 1);
    assert!(sim.enables() > enables);
    assert!(sim_host.variant.device_resets() >= 1);

    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 2)).expect("execute").is_good());
}

#[test]
fn controller_fatal_error_with_idle_host_still_resets() {
    let sim_host = start_default();
    let host = &sim_host.host;
    sim_host.sim.inject_fatal(CONTROLLER_FATAL_ERROR);
    assert!(wait_recovered(host, 1));
    assert!(host.execute(&read_cmd(1, 0)).expect("execute").is_good());
}

#[test]
fn doorbell_desync_triggers_reset() {
    let sim_host = start_default();
    let host = &sim_host.host;
    sim_host.sim.inject_desync(5);
    assert!(wait_recovered(host, 1));
    assert_eq!(host.events().count(EventKind::Desync), 1);
    assert_eq!(sim_host.sim.transfer_doorbell(), 0);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn nac_resets_by_default() {
    let sim_host = start_default();
    let host = &sim_host.host;
    sim_host.sim.inject_uic_error(UicErrorInjection::nac());
    assert!(wait_recovered(host, 1));
    assert_eq!(host.events().count(EventKind::DlError), 1);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn transient_nac_is_absorbed_by_a_nop() {
    let mut config = config();
    config.transient_link_error.enabled = true;
    config.transient_link_error.settle_ms = 10;
    let sim_host = start(config, Default::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    let nops = sim.nops_answered();
    let enables = sim.enables();

    sim.inject_uic_error(UicErrorInjection::nac());
    assert!(wait_until(WAIT, || {
        sim.nops_answered() > nops
            && host.pending_errors().is_empty()
            && host.state() == HostState::Operational
    }));
    assert_eq!(host.stats().resets, 0);
    assert_eq!(sim.enables(), enables);
    assert_eq!(host.events().count(EventKind::DlError), 1);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn transient_nac_with_dead_link_falls_back_to_reset() {
    let mut config = config();
    config.transient_link_error.enabled = true;
    config.transient_link_error.settle_ms = 10;
    config.nop_out_timeout_ms = 20;
    let sim_host = start(config, Default::default());
    let sim = &sim_host.sim;

    sim.drop_nops(1);
    sim.inject_uic_error(UicErrorInjection::nac());
    assert!(wait_recovered(&sim_host.host, 1));
}

#[test]
fn transport_error_requeues_without_reset() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    let (tx, rx) = unbounded();
    host.submit(&read_cmd(0, 0), move |result| {
        tx.send(result).expect("send result");
    })
    .expect("submit");
    assert!(sim.wait_stalled(1, WAIT));

    sim.inject_uic_error(UicErrorInjection {
        tl: 1,
        ..UicErrorInjection::default()
    });
    assert_eq!(
        rx.recv_timeout(WAIT).expect("requeue"),
        CommandResult::Requeue
    );
    assert!(wait_until(WAIT, || {
        host.state() == HostState::Operational && host.pending_errors().is_empty()
    }));
    assert_eq!(host.stats().resets, 0);
    assert_eq!(host.events().count(EventKind::TlError), 1);

    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn stuck_clear_escalates_to_reset() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);
    sim.set_stuck_clear(true);

    let result = host
        .execute_timeout(&read_cmd(0, 0), SHORT)
        .expect("execute");
    assert_eq!(result, CommandResult::Timeout);
    assert!(wait_recovered(host, 1));

    sim.set_stuck_clear(false);
    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn host_reset_is_the_way_out_of_error() {
    let mut config = config();
    config.host_reset_retries = 2;
    config.link_startup_retries = 1;
    let sim_host = start(config, Default::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);

    sim.fail_link_startups(100);
    let err = host.host_reset().expect_err("reset cannot bring the link up");
    assert!(matches!(err, UfsError::ResetFailed { .. }), "unexpected {err}");
    assert_eq!(host.state(), HostState::Error);
    assert!(host.events().count(EventKind::LinkStartupFail) >= 1);
    assert_eq!(host.events().count(EventKind::HostReset), 2);

    let err = host.execute(&read_cmd(0, 0)).expect_err("admission refused");
    assert!(matches!(err, UfsError::HostFailed), "unexpected {err}");

    sim.fail_link_startups(0);
    host.host_reset().expect("host reset");
    assert_eq!(host.state(), HostState::Operational);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn explicit_host_reset_from_operational() {
    let sim_host = start_default();
    let host = &sim_host.host;
    let data = pattern(3, BLOCK as usize);
    assert!(host
        .execute(&ufs_host_core::ScsiCommand::write10(0, 4, data.clone(), BLOCK))
        .expect("write")
        .is_good());

    host.host_reset().expect("host reset");
    assert_eq!(host.state(), HostState::Operational);
    assert_eq!(host.stats().resets, 1);
    let read = host.execute(&read_cmd(0, 4)).expect("read");
    assert_eq!(read.data(), Some(data.as_slice()));
}
