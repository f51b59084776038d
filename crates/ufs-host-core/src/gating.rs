//! Clock gating state machine.
//!
//! Every component that needs the controller awake takes a [`ClockHold`]. When the last hold
//! goes away the gate is armed rather than applied: a worker powers clocks down once the
//! debounce window passes with no new hold. Taking a hold while clocks are off brings them
//! back up synchronously, and only one caller ever drives that transition.

use crate::error::UfsResult;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    fmt, io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn, Level};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatingState {
    ClksOn,
    /// Debounce window before gating.
    ReqClksOff,
    ClksOff,
    /// A caller is bringing clocks back up.
    ReqClksOn,
}

impl fmt::Display for GatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatingState::ClksOn => "clks_on",
            GatingState::ReqClksOff => "req_clks_off",
            GatingState::ClksOff => "clks_off",
            GatingState::ReqClksOn => "req_clks_on",
        })
    }
}

/// The hardware side of gating, supplied by the host.
pub(crate) trait GateOps: Send + Sync {
    /// Work that must keep clocks running even without a hold: a UIC command from an internal
    /// path, an outstanding slot, or recovery in progress.
    fn gate_blocked(&self) -> bool;

    /// Power clocks down. Returns whether the link was put into hibernate on the way.
    fn gate_clocks(&self) -> UfsResult<bool>;

    /// Power clocks up, leaving hibernate first when gating entered it.
    fn ungate_clocks(&self, exit_hibern8: bool) -> UfsResult<()>;
}

struct GateInner {
    mode: GatingState,
    active_reqs: u32,
    /// A gate or ungate is running outside the lock.
    transition: bool,
    enabled: bool,
    delay: Duration,
    deadline: Option<Instant>,
    hibern8_by_gate: bool,
    shutdown: bool,
}

pub struct ClockGating {
    state: Mutex<GateInner>,
    cv: Condvar,
}

impl ClockGating {
    pub fn new(enabled: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateInner {
                mode: GatingState::ClksOn,
                active_reqs: 0,
                transition: false,
                enabled,
                delay,
                deadline: None,
                hibern8_by_gate: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn state(&self) -> GatingState {
        self.state.lock().mode
    }

    pub fn active_requests(&self) -> u32 {
        self.state.lock().active_reqs
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn delay(&self) -> Duration {
        self.state.lock().delay
    }

    /// Keep clocks on until the returned hold is dropped.
    pub(crate) fn hold(self: &Arc<Self>, ops: &dyn GateOps) -> ClockHold {
        let mut st = self.state.lock();
        st.active_reqs += 1;
        loop {
            if st.transition {
                self.cv.wait(&mut st);
                continue;
            }
            match st.mode {
                GatingState::ClksOn => break,
                GatingState::ReqClksOff => {
                    st.mode = GatingState::ClksOn;
                    st.deadline = None;
                    trace!("pending gate cancelled");
                    break;
                }
                GatingState::ReqClksOn => self.cv.wait(&mut st),
                GatingState::ClksOff => {
                    st.mode = GatingState::ReqClksOn;
                    st.transition = true;
                    let exit_hibern8 = std::mem::take(&mut st.hibern8_by_gate);
                    let result = MutexGuard::unlocked(&mut st, || ops.ungate_clocks(exit_hibern8));
                    if let Err(err) = result {
                        warn!(%err, "ungate failed");
                    }
                    st.transition = false;
                    st.mode = GatingState::ClksOn;
                    debug!("clocks ungated");
                    self.cv.notify_all();
                    break;
                }
            }
        }
        ClockHold {
            gating: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.active_reqs > 0, "clock hold released twice");
        st.active_reqs = st.active_reqs.saturating_sub(1);
        if st.active_reqs == 0 && st.enabled && st.mode == GatingState::ClksOn {
            Self::arm(&mut st);
            self.cv.notify_all();
        }
    }

    fn arm(st: &mut GateInner) {
        st.mode = GatingState::ReqClksOff;
        st.deadline = Some(Instant::now() + st.delay);
    }

    /// Turn gating on or off at runtime. Disabling brings clocks back up and keeps them on.
    pub(crate) fn set_enabled(self: &Arc<Self>, enabled: bool, ops: &dyn GateOps) {
        if enabled {
            let mut st = self.state.lock();
            st.enabled = true;
            if st.active_reqs == 0 && st.mode == GatingState::ClksOn {
                Self::arm(&mut st);
                self.cv.notify_all();
            }
        } else {
            let hold = self.hold(ops);
            self.state.lock().enabled = false;
            drop(hold);
        }
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub(crate) fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown = true;
        self.cv.notify_all();
    }
}

/// Reference on the controller clocks. Dropping it releases the reference.
pub struct ClockHold {
    gating: Arc<ClockGating>,
}

impl Drop for ClockHold {
    fn drop(&mut self) {
        self.gating.release();
    }
}

impl fmt::Debug for ClockHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClockHold")
    }
}

pub(crate) fn spawn_gate_worker(
    gating: Arc<ClockGating>,
    ops: Arc<dyn GateOps>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ufs-clkgate".to_string())
        .spawn(move || run_gate_worker(&gating, ops.as_ref()))
}

fn run_gate_worker(gating: &ClockGating, ops: &dyn GateOps) {
    let span = tracing::span!(Level::INFO, "ufs-clkgate");
    let _enter = span.enter();
    let mut st = gating.state.lock();
    loop {
        if st.shutdown {
            break;
        }
        let deadline = match (st.mode, st.deadline) {
            (GatingState::ReqClksOff, Some(deadline)) if !st.transition => deadline,
            _ => {
                gating.cv.wait(&mut st);
                continue;
            }
        };
        if Instant::now() < deadline {
            gating.cv.wait_until(&mut st, deadline);
            continue;
        }

        st.transition = true;
        let blocked = MutexGuard::unlocked(&mut st, || ops.gate_blocked());
        if st.active_reqs != 0 || !st.enabled || st.shutdown {
            // A hold arrived during the check; clocks stay on for it.
            st.transition = false;
            st.mode = GatingState::ClksOn;
            st.deadline = None;
            trace!(holders = st.active_reqs, "gate abandoned");
            gating.cv.notify_all();
            continue;
        }
        if blocked {
            st.transition = false;
            trace!("host busy, gate re-armed");
            ClockGating::arm(&mut st);
            gating.cv.notify_all();
            continue;
        }
        let result = MutexGuard::unlocked(&mut st, || ops.gate_clocks());
        st.transition = false;
        st.deadline = None;
        match result {
            Ok(hibern8) => {
                st.mode = GatingState::ClksOff;
                st.hibern8_by_gate = hibern8;
                debug!(hibern8, "clocks gated");
            }
            Err(err) => {
                warn!(%err, "gating failed, clocks stay on");
                st.mode = GatingState::ClksOn;
            }
        }
        gating.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeOps {
        gates: AtomicU32,
        ungates: AtomicU32,
        blocked: AtomicBool,
        checks: AtomicU32,
        check_delay_ms: AtomicU64,
    }

    impl GateOps for FakeOps {
        fn gate_blocked(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let delay = self.check_delay_ms.load(Ordering::SeqCst);
            if delay != 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            self.blocked.load(Ordering::SeqCst)
        }

        fn gate_clocks(&self) -> UfsResult<bool> {
            self.gates.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn ungate_clocks(&self, exit_hibern8: bool) -> UfsResult<()> {
            assert!(exit_hibern8);
            // Widen the window for concurrent holders.
            thread::sleep(Duration::from_millis(20));
            self.ungates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        gating: Arc<ClockGating>,
        ops: Arc<FakeOps>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl Fixture {
        fn new(delay: Duration) -> Self {
            let gating = ClockGating::new(true, delay);
            let ops = Arc::new(FakeOps::default());
            let worker = spawn_gate_worker(gating.clone(), ops.clone()).unwrap();
            Self {
                gating,
                ops,
                worker: Some(worker),
            }
        }

        fn wait_for(&self, state: GatingState) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.gating.state() != state {
                assert!(Instant::now() < deadline, "never reached {state}");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.gating.shutdown();
            if let Some(worker) = self.worker.take() {
                worker.join().unwrap();
            }
        }
    }

    #[test]
    fn release_gates_after_debounce() {
        let fx = Fixture::new(Duration::from_millis(10));
        let hold = fx.gating.hold(fx.ops.as_ref());
        assert_eq!(fx.gating.state(), GatingState::ClksOn);
        drop(hold);
        assert_eq!(fx.gating.state(), GatingState::ReqClksOff);
        fx.wait_for(GatingState::ClksOff);
        assert_eq!(fx.ops.gates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hold_release_inside_window_changes_nothing() {
        let fx = Fixture::new(Duration::from_secs(60));
        drop(fx.gating.hold(fx.ops.as_ref()));
        assert_eq!(fx.gating.state(), GatingState::ReqClksOff);

        let hold = fx.gating.hold(fx.ops.as_ref());
        drop(hold);
        assert_eq!(fx.gating.state(), GatingState::ReqClksOff);
        assert_eq!(fx.gating.active_requests(), 0);
        assert_eq!(fx.ops.gates.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ops.ungates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_holds_ungate_once() {
        let fx = Fixture::new(Duration::from_millis(1));
        drop(fx.gating.hold(fx.ops.as_ref()));
        fx.wait_for(GatingState::ClksOff);

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let holders: Vec<_> = (0..2)
            .map(|_| {
                let gating = fx.gating.clone();
                let ops = fx.ops.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let hold = gating.hold(ops.as_ref());
                    assert_eq!(gating.state(), GatingState::ClksOn);
                    hold
                })
            })
            .collect();
        let holds: Vec<_> = holders.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(fx.ops.ungates.load(Ordering::SeqCst), 1);
        assert_eq!(fx.gating.active_requests(), 2);
        drop(holds);
    }

    #[test]
    fn busy_host_rearms_instead_of_gating() {
        let fx = Fixture::new(Duration::from_millis(5));
        fx.ops.blocked.store(true, Ordering::SeqCst);
        drop(fx.gating.hold(fx.ops.as_ref()));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fx.ops.gates.load(Ordering::SeqCst), 0);
        assert_eq!(fx.gating.state(), GatingState::ReqClksOff);

        fx.ops.blocked.store(false, Ordering::SeqCst);
        fx.wait_for(GatingState::ClksOff);
    }

    #[test]
    fn hold_during_busy_check_cancels_the_gate() {
        let fx = Fixture::new(Duration::from_millis(1));
        fx.ops.check_delay_ms.store(100, Ordering::SeqCst);
        drop(fx.gating.hold(fx.ops.as_ref()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.ops.checks.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "worker never checked the host");
            thread::sleep(Duration::from_millis(1));
        }

        // Taken while the worker is still inside the check.
        let hold = fx.gating.hold(fx.ops.as_ref());
        assert_eq!(fx.gating.state(), GatingState::ClksOn);
        assert_eq!(fx.ops.gates.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ops.ungates.load(Ordering::SeqCst), 0);

        fx.ops.check_delay_ms.store(0, Ordering::SeqCst);
        drop(hold);
        fx.wait_for(GatingState::ClksOff);
        assert_eq!(fx.ops.gates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabling_keeps_clocks_on() {
        let fx = Fixture::new(Duration::from_millis(1));
        drop(fx.gating.hold(fx.ops.as_ref()));
        fx.wait_for(GatingState::ClksOff);
        fx.gating.set_enabled(false, fx.ops.as_ref());
        assert_eq!(fx.gating.state(), GatingState::ClksOn);
        drop(fx.gating.hold(fx.ops.as_ref()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fx.gating.state(), GatingState::ClksOn);
    }
}
