mod common;

use common::*;
use crossbeam_channel::{unbounded, Receiver};
use std::time::Duration;
use ufs_host_core::{CancelOutcome, CommandHandle, CommandResult, EventKind, UfsError, UfsHost};
use ufs_proto::TaskServiceResponse;

fn submit(host: &UfsHost, lun: u8, lba: u32) -> (CommandHandle, Receiver<CommandResult>) {
    let (tx, rx) = unbounded();
    let handle = host
        .submit(&read_cmd(lun, lba), move |result| {
            tx.send(result).expect("send result");
        })
        .expect("submit");
    (handle, rx)
}

#[test]
fn cancel_withdraws_a_stalled_command() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    let (handle, rx) = submit(host, 0, 0);
    assert!(sim.wait_stalled(1, WAIT));

    assert_eq!(host.cancel(handle).expect("cancel"), CancelOutcome::Aborted);
    assert_eq!(rx.recv_timeout(WAIT).expect("result"), CommandResult::Aborted);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(sim.transfer_doorbell(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(host.stats().aborts, 1);
    assert_eq!(host.events().count(EventKind::TaskAbort), 1);

    // The slot is free again.
    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 1)).expect("execute").is_good());
    assert_eq!(host.stats().resets, 0);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let sim_host = start_default();
    let host = &sim_host.host;

    let (handle, rx) = submit(host, 1, 0);
    assert!(rx.recv_timeout(WAIT).expect("result").is_good());
    assert!(wait_until(WAIT, || host.outstanding() == 0));

    assert_eq!(
        host.cancel(handle).expect("cancel"),
        CancelOutcome::AlreadyCompleted
    );
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(host.stats().aborts, 0);
}

#[test]
fn failed_task_query_escalates_to_reset() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);
    let (handle, rx) = submit(host, 0, 0);
    assert!(sim.wait_stalled(1, WAIT));

    sim.set_tm_response(Some(TaskServiceResponse::Failed));
    let err = host.cancel(handle).expect_err("query task fails");
    assert!(
        matches!(err, UfsError::TaskManagement { .. }),
        "unexpected {err}"
    );
    assert_eq!(rx.recv_timeout(WAIT).expect("result"), CommandResult::Requeue);
    assert!(wait_recovered(host, 1));

    sim.set_tm_response(None);
    sim.set_stall(false);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn logical_unit_reset_requeues_only_that_unit() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    let (_, lun0_a) = submit(host, 0, 0);
    let (_, lun0_b) = submit(host, 0, 1);
    let (_, lun1) = submit(host, 1, 0);
    assert!(sim.wait_stalled(3, WAIT));

    host.device_reset(0).expect("logical unit reset");
    for rx in [&lun0_a, &lun0_b] {
        assert_eq!(rx.recv_timeout(WAIT).expect("result"), CommandResult::Requeue);
    }
    assert!(lun1.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(host.events().count(EventKind::DeviceReset), 1);
    assert_eq!(host.stats().requeued, 2);

    sim.set_stall(false);
    assert!(lun1.recv_timeout(WAIT).expect("result").is_good());
    assert_eq!(host.stats().resets, 0);
}
