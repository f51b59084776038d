mod common;

use common::*;
use crossbeam_channel::{bounded, unbounded};
use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};
use ufs_host_core::{
    DevicePowerMode, EventKind, GatingState, HostConfig, HostQuirks, HostState, LinkState,
    UfsError,
};
use ufs_host_sim::{SimConfig, SimHost};
use ufs_proto::{regs::DEVICE_FATAL_ERROR, PwrStatus};

fn gating_config(delay_ms: u64) -> HostConfig {
    let mut config = config();
    config.clock_gating.enabled = true;
    config.clock_gating.delay_ms = delay_ms;
    config
}

fn wait_gated(sim_host: &SimHost) -> bool {
    wait_until(WAIT, || {
        sim_host.host.gating_state() == GatingState::ClksOff && !sim_host.sim.clocks_on()
    })
}

#[test]
fn idle_host_gates_into_hibern8() {
    let sim_host = start(gating_config(20), SimConfig::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    assert!(wait_gated(&sim_host));
    assert!(sim.link_hibern8());
    assert_eq!(host.link_status().link, LinkState::Hibern8);
    let stats = host.stats();
    assert!(stats.gates >= 1);
    assert!(stats.hibern8_enters >= 1);

    let data = pattern(9, BLOCK as usize);
    assert!(host
        .execute(&ufs_host_core::ScsiCommand::write10(0, 1, data.clone(), BLOCK))
        .expect("write")
        .is_good());
    assert_eq!(
        host.execute(&read_cmd(0, 1)).expect("read").data(),
        Some(data.as_slice())
    );
    assert!(host.stats().ungates >= 1);
    assert!(host.stats().hibern8_exits >= 1);

    assert!(wait_gated(&sim_host));
    assert_eq!(sim.clock_violations(), 0);
}

#[test]
fn concurrent_holds_ungate_once() {
    let sim_host = start(gating_config(20), SimConfig::default());
    let (host, sim, variant) = (&sim_host.host, &sim_host.sim, &sim_host.variant);
    assert!(wait_gated(&sim_host));
    let clock_ons = variant.clock_ons();
    let ungates = host.stats().ungates;

    let barrier = Barrier::new(4);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let hold = host.hold_clocks();
                assert!(sim.clocks_on());
                assert_eq!(host.gating_state(), GatingState::ClksOn);
                barrier.wait();
                drop(hold);
            });
        }
    });

    assert_eq!(variant.clock_ons(), clock_ons + 1);
    assert_eq!(host.stats().ungates, ungates + 1);
    assert!(wait_gated(&sim_host));
    assert_eq!(sim.clock_violations(), 0);
}

#[test]
fn release_inside_the_delay_keeps_clocks_on() {
    let sim_host = start(gating_config(10_000), SimConfig::default());
    let host = &sim_host.host;
    assert_eq!(host.gating_state(), GatingState::ReqClksOff);

    let hold = host.hold_clocks();
    assert_eq!(host.gating_state(), GatingState::ClksOn);
    drop(hold);
    assert_eq!(host.gating_state(), GatingState::ReqClksOff);

    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
    assert_eq!(host.stats().gates, 0);
    assert_eq!(sim_host.variant.clock_offs(), 0);
    assert!(sim_host.sim.clocks_on());
}

#[test]
fn disabling_gating_brings_clocks_back() {
    let sim_host = start(gating_config(20), SimConfig::default());
    let host = &sim_host.host;
    assert!(wait_gated(&sim_host));

    host.set_clock_gating(false);
    assert_eq!(host.gating_state(), GatingState::ClksOn);
    assert!(sim_host.sim.clocks_on());
    assert!(!sim_host.sim.link_hibern8());
    thread::sleep(Duration::from_millis(60));
    assert_eq!(host.gating_state(), GatingState::ClksOn);

    host.set_gating_delay(Duration::from_millis(5));
    host.set_clock_gating(true);
    assert!(wait_gated(&sim_host));
}

#[test]
fn fault_before_the_doorbell_returns_the_slot() {
    let sim_host = start(gating_config(20), SimConfig::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    assert!(wait_gated(&sim_host));

    // The submit's clock hold ungates; the fault lands after admission, before the doorbell.
    let (fired_tx, fired_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let fault_sim = Arc::clone(sim);
    sim_host.variant.on_next_clock_on(move || {
        fault_sim.inject_fatal(DEVICE_FATAL_ERROR);
        fired_tx.send(()).expect("signal fault");
        let _ = release_rx.recv_timeout(WAIT);
    });

    thread::scope(|s| {
        let submitter = s.spawn(|| host.submit(&read_cmd(0, 0), |_| panic!("never issued")));
        fired_rx.recv_timeout(WAIT).expect("clocks came up for the submit");
        assert!(wait_until(WAIT, || host.state() != HostState::Operational));
        release_tx.send(()).expect("release submitter");
        let err = submitter
            .join()
            .expect("submitter")
            .expect_err("admission lost before the doorbell");
        assert!(matches!(err, UfsError::Busy(_)), "unexpected {err}");
    });
    assert_eq!(host.slots_in_use(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(sim.transfer_doorbell(), 0);
    assert_eq!(host.stats().issued, 0);

    assert!(wait_recovered(host, 1));
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn failed_clock_gate_leaves_hibern8() {
    let sim_host =
        SimHost::assemble(gating_config(20), SimConfig::default()).expect("assemble host");
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim_host.variant.refuse_clock_off(true);
    host.init().expect("init");

    assert!(wait_until(WAIT, || {
        host.stats().hibern8_exits >= 1 && host.gating_state() == GatingState::ClksOn
    }));
    assert_eq!(host.stats().hibern8_enters, 1);
    assert!(sim.clocks_on());
    assert!(!sim.link_hibern8());
    assert_eq!(host.link_status().link, LinkState::Active);
    assert_eq!(host.stats().gates, 0);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn gating_skips_hibern8_under_auto_hibernate() {
    let mut config = gating_config(20);
    config.auto_hibern8_idle_us = 2_000;
    let sim_host = start(config, SimConfig::default());
    assert_ne!(sim_host.sim.auto_hibern8_timer(), 0);
    assert!(wait_gated(&sim_host));
    assert!(!sim_host.sim.link_hibern8());
    assert_eq!(sim_host.host.stats().hibern8_enters, 0);
}

#[test]
fn gating_skips_hibern8_with_quirk() {
    let sim_host = start(
        gating_config(20),
        SimConfig {
            quirks: HostQuirks::NO_HIBERN8_ON_GATE,
            ..SimConfig::default()
        },
    );
    assert!(wait_gated(&sim_host));
    assert!(!sim_host.sim.link_hibern8());
    assert!(sim_host.host.execute(&read_cmd(0, 0)).expect("execute").is_good());
    assert!(wait_gated(&sim_host));
    assert_eq!(sim_host.sim.clock_violations(), 0);
}

#[test]
fn broken_auto_hibernate_is_left_off() {
    let mut config = config();
    config.auto_hibern8_idle_us = 2_000;
    let sim_host = start(
        config,
        SimConfig {
            quirks: HostQuirks::BROKEN_AUTO_HIBERN8,
            ..SimConfig::default()
        },
    );
    assert_eq!(sim_host.sim.auto_hibern8_timer(), 0);
}

#[test]
fn auto_hibernate_failure_resets() {
    let mut config = config();
    config.auto_hibern8_idle_us = 2_000;
    let sim_host = start(config, SimConfig::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    assert_ne!(sim.auto_hibern8_timer(), 0);

    sim.raise_auto_hibern8(true, PwrStatus::Busy);
    assert!(wait_recovered(host, 1));
    assert_eq!(host.events().count(EventKind::AutoHibern8Error), 1);
    assert_ne!(sim.auto_hibern8_timer(), 0);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn suspend_to_sleep_and_back() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);

    host.suspend(None).expect("suspend");
    assert!(host.is_suspended());
    assert_eq!(sim.device_power_mode(), DevicePowerMode::Sleep);
    assert!(sim.link_hibern8());
    let status = host.link_status();
    assert_eq!(status.link, LinkState::Hibern8);
    assert_eq!(status.device, DevicePowerMode::Sleep);

    let err = host.execute(&read_cmd(0, 0)).expect_err("suspended");
    assert!(matches!(err, UfsError::Suspended), "unexpected {err}");
    let err = host.suspend(Some(3)).expect_err("already suspended");
    assert!(matches!(err, UfsError::Suspended), "unexpected {err}");

    host.resume().expect("resume");
    assert!(!host.is_suspended());
    assert_eq!(sim.device_power_mode(), DevicePowerMode::Active);
    assert!(!sim.link_hibern8());
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
    assert_eq!(host.stats().resets, 0);
}

#[test]
fn suspend_with_link_off_resumes_through_reset() {
    let sim_host = start_default();
    let (host, sim) = (&sim_host.host, &sim_host.sim);

    host.suspend(Some(5)).expect("suspend");
    assert_eq!(sim.device_power_mode(), DevicePowerMode::PowerDown);
    assert!(!sim.link_up());

    host.resume().expect("resume");
    assert_eq!(host.state(), HostState::Operational);
    assert!(!host.is_suspended());
    assert_eq!(sim.device_power_mode(), DevicePowerMode::Active);
    assert!(host.stats().resets >= 1);
    assert!(host.execute(&read_cmd(1, 0)).expect("execute").is_good());
}

#[test]
fn suspend_gives_up_when_commands_do_not_drain() {
    let mut config = config();
    config.command_timeout_ms = 100;
    let sim_host = start(config, SimConfig::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_stall(true);
    let (tx, rx) = unbounded();
    host.submit(&read_cmd(0, 0), move |result| {
        tx.send(result).expect("send result");
    })
    .expect("submit");
    assert!(sim.wait_stalled(1, WAIT));

    let err = host.suspend(Some(3)).expect_err("command still in flight");
    assert!(
        matches!(err, UfsError::Timeout { what: "suspend drain", .. }),
        "unexpected {err}"
    );
    assert!(!host.is_suspended());
    assert_eq!(host.events().count(EventKind::SuspendFail), 1);

    sim.set_stall(false);
    assert!(rx.recv_timeout(WAIT).expect("result").is_good());
    host.suspend(Some(3)).expect("suspend");
    host.resume().expect("resume");
}

#[test]
fn active_level_only_blocks_admission() {
    let sim_host = start_default();
    let host = &sim_host.host;
    let uic = sim_host.sim.uic_total();
    host.suspend(Some(0)).expect("suspend");
    assert_eq!(sim_host.sim.uic_total(), uic);
    assert!(host.is_suspended());
    host.resume().expect("resume");
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}

#[test]
fn invalid_level_is_rejected() {
    let sim_host = start_default();
    let err = sim_host.host.suspend(Some(9)).expect_err("no such level");
    assert!(matches!(err, UfsError::InvalidArgument(_)), "unexpected {err}");
    assert!(!sim_host.host.is_suspended());
}

#[test]
fn failed_hibern8_enter_abandons_suspend() {
    let mut config = config();
    config.hibern8_enter_retries = 1;
    let sim_host = start(config, SimConfig::default());
    let (host, sim) = (&sim_host.host, &sim_host.sim);
    sim.set_hibern8_enter_status(Some(PwrStatus::Busy));

    host.suspend(Some(3)).expect_err("hibern8 enter fails");
    assert!(!host.is_suspended());
    assert_eq!(host.events().count(EventKind::SuspendFail), 1);
    assert_eq!(host.events().count(EventKind::Hibern8EnterFail), 1);

    sim.set_hibern8_enter_status(None);
    assert!(wait_recovered(host, 1));
    assert_eq!(sim.device_power_mode(), DevicePowerMode::Active);
    assert!(host.execute(&read_cmd(0, 0)).expect("execute").is_good());
}
