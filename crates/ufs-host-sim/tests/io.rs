mod common;

use common::*;
use crossbeam_channel::{bounded, unbounded};
use std::{sync::Arc, thread, time::Duration};
use ufs_host_core::{
    CommandResult, HostState, LinkState, PowerModeConfig, PowerModeInfo, ScsiCommand, UfsError,
};
use ufs_host_sim::SimConfig;
use ufs_proto::{
    mib,
    uic::{PA_CONNECTEDRXDATALANES, PA_MAXRXHSGEAR},
    upiu::{attr, desc, flag},
    Ocs, PowerMode, UicOpcode,
};

#[test]
fn boot_brings_host_operational() {
    let sim_host = start_default();
    let host = &sim_host.host;
    assert_eq!(host.state(), HostState::Operational);
    assert_eq!(host.outstanding(), 0);

    let caps = host.capabilities();
    assert_eq!(caps.transfer_slots(), 32);
    assert_eq!(caps.task_slots(), 8);

    let status = host.link_status();
    assert_eq!(status.link, LinkState::Active);
    let power = status.power.expect("power mode applied during init");
    assert_eq!(power.pwr_rx, PowerMode::Fast);
    assert_eq!(power.gear_rx, 4);
    assert_eq!(sim_host.sim.uic_count(UicOpcode::DmeLinkStartup), 1);
    assert_eq!(sim_host.sim.power_mode_changes(), 1);

    // Bring-up only talks to the device management slot.
    let stats = host.stats();
    assert_eq!(stats.issued, 0);
    assert_eq!(stats.completed, 0);
    assert!(stats.dev_cmds > 0);
}

#[test]
fn first_command_uses_slot_zero_and_completes_once() {
    let sim_host = start_default();
    let host = &sim_host.host;
    let (tx, rx) = unbounded();
    let handle = host
        .submit(&ScsiCommand::test_unit_ready(0), move |result| {
            tx.send(result).expect("send result");
        })
        .expect("submit");
    assert_eq!(handle.tag(), 0);
    assert_eq!(handle.lun(), 0);

    let result = rx.recv_timeout(WAIT).expect("completion");
    assert!(result.is_good(), "unexpected result {result}");
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(wait_until(WAIT, || host.outstanding() == 0));

    let stats = host.stats();
    assert_eq!(stats.issued, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.latency.count, 1);
}

#[test]
fn write_then_read_back() {
    let sim_host = start_default();
    let host = &sim_host.host;
    let data = pattern(7, BLOCK as usize * 2);

    let written = host
        .execute(&ScsiCommand::write10(1, 10, data.clone(), BLOCK))
        .expect("write");
    assert!(written.is_good(), "write failed: {written}");

    let read = host
        .execute(&ScsiCommand::read10(1, 10, 2, BLOCK))
        .expect("read");
    assert_eq!(read.data(), Some(data.as_slice()));

    let other_lun = host.execute(&read_cmd(0, 10)).expect("read lun 0");
    assert_eq!(other_lun.data(), Some(vec![0u8; BLOCK as usize].as_slice()));
}

#[test]
fn out_of_range_read_reports_check_condition() {
    let sim_host = start_default();
    let result = sim_host
        .host
        .execute(&read_cmd(0, 10_000))
        .expect("execute");
    match result {
        CommandResult::DeviceError(resp) => {
            assert_eq!(resp.status, 0x02);
            assert_eq!(resp.sense[2] & 0x0f, 0x05);
        }
        other => panic!("expected check condition, got {other}"),
    }
}

#[test]
fn short_buffer_reports_ocs() {
    let sim_host = start_default();
    let result = sim_host
        .host
        .execute(&ScsiCommand::read(0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], 512))
        .expect("execute");
    assert_eq!(result, CommandResult::Ocs(Ocs::MismatchDataBufSize));
    assert_eq!(sim_host.host.stats().failed, 1);
}

#[test]
fn concurrent_submitters_all_complete() {
    let sim_host = start(
        config(),
        SimConfig {
            latency: Duration::from_millis(1),
            ..SimConfig::default()
        },
    );
    let host = &sim_host.host;
    let (tx, rx) = unbounded();
    thread::scope(|s| {
        for worker in 0..4u32 {
            let tx = tx.clone();
            s.spawn(move || {
                for i in 0..20u32 {
                    let tx = tx.clone();
                    host.submit(&read_cmd(0, worker * 20 + i), move |result| {
                        tx.send(result).expect("send result");
                    })
                    .expect("submit");
                }
            });
        }
    });
    for _ in 0..80 {
        let result = rx.recv_timeout(WAIT).expect("completion");
        assert!(result.is_good(), "unexpected result {result}");
    }
    let stats = host.stats();
    assert_eq!(stats.issued, 80);
    assert_eq!(stats.completed, 80);
    assert!(stats.max_queue_depth >= 1 && stats.max_queue_depth <= 31);
}

#[test]
fn full_queue_blocks_the_next_submitter() {
    // Four transfer slots leave three for I/O.
    let sim_host = start(
        config(),
        SimConfig {
            transfer_slots: 4,
            ..SimConfig::default()
        },
    );
    let host = &sim_host.host;
    let sim = &sim_host.sim;
    sim.set_stall(true);

    let (tx, rx) = unbounded();
    for lba in 0..3 {
        let tx = tx.clone();
        host.submit(&read_cmd(0, lba), move |result| {
            tx.send(result).expect("send result");
        })
        .expect("submit");
    }
    assert!(sim.wait_stalled(3, WAIT));

    let (issued_tx, issued_rx) = bounded(1);
    thread::scope(|s| {
        let tx = tx.clone();
        s.spawn(move || {
            let handle = host
                .submit(&read_cmd(0, 3), move |result| {
                    tx.send(result).expect("send result");
                })
                .expect("submit");
            issued_tx.send(handle.tag()).expect("send tag");
        });

        assert!(issued_rx.recv_timeout(Duration::from_millis(100)).is_err());
        sim.set_stall(false);
        let tag = issued_rx.recv_timeout(WAIT).expect("fourth command issued");
        assert!(tag < 3);
    });

    for _ in 0..4 {
        let result = rx.recv_timeout(WAIT).expect("completion");
        assert!(result.is_good(), "unexpected result {result}");
    }
    assert!(host.stats().max_queue_depth <= 3);
}

#[test]
fn callback_may_resubmit_while_another_submitter_waits() {
    // Two transfer slots leave one for I/O.
    let sim_host = Arc::new(start(
        config(),
        SimConfig {
            transfer_slots: 2,
            ..SimConfig::default()
        },
    ));
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);

    let (tx, rx) = unbounded();
    let resubmit = Arc::clone(&sim_host);
    let first_tx = tx.clone();
    host.submit(&read_cmd(0, 0), move |result| {
        first_tx
            .send(("first", result.is_good()))
            .expect("send result");
        let again_tx = first_tx.clone();
        let accepted = resubmit.host.submit(&read_cmd(0, 1), move |result| {
            again_tx
                .send(("resubmitted", result.is_good()))
                .expect("send result");
        });
        first_tx
            .send(("resubmit accepted", accepted.is_ok()))
            .expect("send result");
    })
    .expect("submit");
    assert!(sim.wait_stalled(1, WAIT));

    thread::scope(|s| {
        let tx = tx.clone();
        s.spawn(move || {
            host.submit(&read_cmd(0, 2), move |result| {
                tx.send(("queued", result.is_good())).expect("send result");
            })
            .expect("submit");
        });
        // The second submitter queues for the only slot before the first command completes.
        thread::sleep(Duration::from_millis(50));
        sim.set_stall(false);
    });

    let mut seen: Vec<_> = (0..4)
        .map(|_| rx.recv_timeout(WAIT).expect("completion"))
        .collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("first", true),
            ("queued", true),
            ("resubmit accepted", true),
            ("resubmitted", true),
        ]
    );
    assert!(wait_until(WAIT, || host.outstanding() == 0));
}

#[test]
fn flags_attributes_and_descriptors() {
    let sim_host = start_default();
    let host = &sim_host.host;

    assert!(!host.read_flag(flag::DEVICE_INIT).expect("read fDeviceInit"));
    assert!(host.set_flag(flag::BKOPS_EN).expect("set"));
    assert!(host.read_flag(flag::BKOPS_EN).expect("read"));
    assert!(!host.toggle_flag(flag::BKOPS_EN).expect("toggle"));
    assert!(!host.clear_flag(flag::BKOPS_EN).expect("clear"));

    host.write_attribute(attr::ACTIVE_ICC_LVL, 0, 0, 5)
        .expect("write attribute");
    assert_eq!(
        host.read_attribute(attr::ACTIVE_ICC_LVL, 0, 0)
            .expect("read attribute"),
        5
    );

    let config_desc = pattern(1, 0x20);
    host.write_descriptor(desc::CONFIGURATION, 0, 0, &config_desc)
        .expect("write descriptor");
    let back = host
        .read_descriptor(desc::CONFIGURATION, 0, 0, 0x20)
        .expect("read descriptor");
    assert_eq!(back, config_desc);

    let err = host
        .write_descriptor(desc::DEVICE, 0, 0, &[0; 4])
        .expect_err("device descriptor is read-only");
    assert!(matches!(err, UfsError::Query { .. }), "unexpected {err}");
}

#[test]
fn device_info_comes_from_descriptor() {
    let sim_host = start_default();
    let info = sim_host.host.device_info().expect("device info");
    assert_eq!(info.manufacturer_id, 0x0BAD);
    assert_eq!(info.spec_version, 0x0310);
    assert_eq!(info.num_lu, 2);
    assert_eq!(info.queue_depth, 32);
}

#[test]
fn dme_get_reads_link_attributes() {
    let sim_host = start_default();
    let host = &sim_host.host;
    assert_eq!(host.dme_get(mib(PA_CONNECTEDRXDATALANES)).expect("dme get"), 2);
    assert_eq!(host.dme_peer_get(mib(PA_MAXRXHSGEAR)).expect("peer get"), 4);
    host.dme_set(mib(PA_MAXRXHSGEAR), 3).expect("dme set");
    assert_eq!(host.dme_get(mib(PA_MAXRXHSGEAR)).expect("dme get"), 3);
}

#[test]
fn nop_round_trip() {
    let sim_host = start_default();
    let before = sim_host.sim.nops_answered();
    sim_host.host.nop().expect("nop");
    assert_eq!(sim_host.sim.nops_answered(), before + 1);
}

#[test]
fn repeated_power_mode_is_a_no_op() {
    let sim_host = start_default();
    let host = &sim_host.host;
    let current = PowerModeInfo::from_config(&host.config().power_mode);
    let uic_before = sim_host.sim.uic_total();

    host.change_power_mode(current).expect("same mode");
    assert_eq!(sim_host.sim.uic_total(), uic_before);

    let slow = PowerModeInfo::from_config(&PowerModeConfig {
        gear: 1,
        mode: ufs_host_core::LinkMode::SlowAuto,
        ..PowerModeConfig::default()
    });
    host.change_power_mode(slow).expect("slow mode");
    assert_eq!(sim_host.sim.power_mode_changes(), 2);
    let status = host.link_status();
    assert_eq!(status.requested, Some(slow));
    let power = status.power.expect("power mode");
    assert_eq!(power.gear_rx, 1);
    assert_eq!(power.pwr_tx, PowerMode::SlowAuto);

    let uic_before = sim_host.sim.uic_total();
    host.change_power_mode(slow).expect("same slow mode");
    assert_eq!(sim_host.sim.uic_total(), uic_before);
}
