//! Register-level model of a UFSHCI controller with one attached device.
//!
//! Register accesses are serviced synchronously under one state lock. UIC commands complete
//! inside the write of the command register. Transfer and task requests are picked up by an
//! engine thread which hands them to the device model and then drops their doorbell bits.
//! A separate thread plays the level-triggered interrupt line: it calls the host's
//! [`IrqHandle`] while any enabled status bit is pending, never with the state lock held.

use crate::{
    device::{Answer, SimDevice},
    faults::{Faults, UicErrorInjection},
    SimConfig,
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};
use ufs_host_core::{
    DevicePowerMode, HostRegisters, IrqHandle, RequestLists, UfsError, UfsResult,
};
use ufs_proto::{
    regs::{
        CONTROLLER_ENABLE, DEVICE_PRESENT, REG_AUTO_HIBERNATE_IDLE_TIMER,
        REG_CONTROLLER_CAPABILITIES, REG_CONTROLLER_ENABLE, REG_CONTROLLER_STATUS,
        REG_INTERRUPT_ENABLE, REG_INTERRUPT_STATUS, REG_UFS_VERSION,
        REG_UIC_COMMAND, REG_UIC_COMMAND_ARG_1, REG_UIC_COMMAND_ARG_2, REG_UIC_COMMAND_ARG_3,
        REG_UIC_ERROR_CODE_DATA_LINK_LAYER, REG_UIC_ERROR_CODE_DME,
        REG_UIC_ERROR_CODE_NETWORK_LAYER, REG_UIC_ERROR_CODE_PHY_ADAPTER_LAYER,
        REG_UIC_ERROR_CODE_TRANSPORT_LAYER, REG_UTP_TASK_REQ_DOOR_BELL,
        REG_UTP_TASK_REQ_LIST_CLEAR, REG_UTP_TASK_REQ_LIST_RUN_STOP,
        REG_UTP_TRANSFER_REQ_DOOR_BELL, REG_UTP_TRANSFER_REQ_LIST_CLEAR,
        REG_UTP_TRANSFER_REQ_LIST_RUN_STOP, UIC_COMMAND_COMPL, UIC_COMMAND_READY,
        UIC_DATA_LINK_LAYER_ERROR, UIC_DME_ERROR, UIC_ERROR, UIC_HIBERNATE_ENTER,
        UIC_HIBERNATE_EXIT, UIC_NETWORK_LAYER_ERROR, UIC_PHY_ADAPTER_LAYER_ERROR,
        UIC_POWER_MODE, UIC_POWER_MODE_CHANGE_REQ_STATUS_SHIFT, UIC_TRANSPORT_LAYER_ERROR,
        UTP_LIST_RUN, UTP_TASK_REQ_COMPL, UTP_TASK_REQ_LIST_READY, UTP_TRANSFER_REQ_COMPL,
        UTP_TRANSFER_REQ_LIST_READY,
    },
    uic::{
        PA_AVAILRXDATALANES, PA_AVAILTXDATALANES, PA_CONNECTEDRXDATALANES,
        PA_CONNECTEDTXDATALANES, PA_MAXRXHSGEAR, PA_MAXRXPWMGEAR, PA_PWRMODE,
    },
    upiu::RESPONSE_UPIU_MAX_LEN,
    Capabilities, Ocs, PwrStatus, TaskRequestUpiu, TaskResponse, TaskServiceResponse,
    TmFunction, TransactionType, UicOpcode, UicResult,
};

const UFSHCI_VERSION: u32 = 0x0000_0310;
const MAX_PWM_GEAR: u32 = 4;

fn bits(mut mask: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(bit)
    })
}

/// Both ends of the UniPro link.
#[derive(Default)]
struct LinkModel {
    up: bool,
    hibern8: bool,
    local: HashMap<u16, u32>,
    peer: HashMap<u16, u32>,
}

impl LinkModel {
    fn start(&mut self, config: &SimConfig) {
        self.up = true;
        self.hibern8 = false;
        for side in [&mut self.local, &mut self.peer] {
            side.insert(PA_AVAILRXDATALANES, config.lanes);
            side.insert(PA_AVAILTXDATALANES, config.lanes);
            side.insert(PA_CONNECTEDRXDATALANES, config.lanes);
            side.insert(PA_CONNECTEDTXDATALANES, config.lanes);
            side.insert(PA_MAXRXHSGEAR, config.max_hs_gear);
            side.insert(PA_MAXRXPWMGEAR, MAX_PWM_GEAR);
        }
    }
}

struct SimState {
    enabled: bool,
    is: u32,
    ie: u32,
    upmcrs: u8,
    ahit: u32,
    /// PA, DL, NL, TL and DME error code registers. Cleared on read.
    uic_errors: [u32; 5],
    utrldbr: u32,
    utmrldbr: u32,
    utrl_run: bool,
    utmrl_run: bool,
    uic_args: [u32; 3],
    lists: Option<Arc<RequestLists>>,
    link: LinkModel,
    /// Bumped whenever a slot is rung or cleared, so stale engine work is discarded.
    transfer_epoch: Vec<u64>,
    task_epoch: Vec<u64>,
    /// Slots the engine has picked up.
    taken: u32,
    tm_taken: u32,
    /// Picked up but held back by the stall fault.
    parked: u32,
    /// Doorbell bits set by the desync fault.
    phantom: u32,
    clocks_on: bool,
    faults: Faults,
    irq: Option<IrqHandle>,
    irq_seq: u64,
    uic_counts: HashMap<u8, u64>,
    power_mode_changes: u64,
    enables: u64,
    shutdown: bool,
}

impl SimState {
    fn new(config: &SimConfig) -> Self {
        Self {
            enabled: false,
            is: 0,
            ie: 0,
            upmcrs: 0,
            ahit: 0,
            uic_errors: [0; 5],
            utrldbr: 0,
            utmrldbr: 0,
            utrl_run: false,
            utmrl_run: false,
            uic_args: [0; 3],
            lists: None,
            link: LinkModel::default(),
            transfer_epoch: vec![0; config.transfer_slots],
            task_epoch: vec![0; config.task_slots],
            taken: 0,
            tm_taken: 0,
            parked: 0,
            phantom: 0,
            clocks_on: true,
            faults: Faults::default(),
            irq: None,
            irq_seq: 0,
            uic_counts: HashMap::new(),
            power_mode_changes: 0,
            enables: 0,
            shutdown: false,
        }
    }

    fn lists_ready(&self) -> bool {
        self.enabled && self.lists.is_some()
    }

    fn status(&self) -> u32 {
        let mut status = (self.upmcrs as u32) << UIC_POWER_MODE_CHANGE_REQ_STATUS_SHIFT;
        if self.link.up {
            status |= DEVICE_PRESENT;
        }
        if self.enabled {
            status |= UIC_COMMAND_READY;
        }
        if self.lists_ready() {
            status |= UTP_TRANSFER_REQ_LIST_READY | UTP_TASK_REQ_LIST_READY;
        }
        status
    }

    /// Commands sitting in the device: rung, not yet answered, not phantom.
    fn pending_in_device(&self, tag: usize) -> bool {
        tag < 32 && (self.utrldbr & !self.phantom) & (1 << tag) != 0
    }

    fn task_service(&self, req: &TaskRequestUpiu) -> TaskServiceResponse {
        let target = req.input_param2 as usize;
        match req.function {
            TmFunction::QueryTask if self.pending_in_device(target) => {
                TaskServiceResponse::Succeeded
            }
            TmFunction::AbortTask => {
                debug!(lun = req.lun, target, "device aborted task");
                TaskServiceResponse::Complete
            }
            TmFunction::LogicalUnitReset => {
                debug!(lun = req.lun, "logical unit reset");
                TaskServiceResponse::Complete
            }
            _ => TaskServiceResponse::Complete,
        }
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.is = 0;
        self.ie = 0;
        self.upmcrs = 0;
        self.uic_errors = [0; 5];
        self.utrldbr = 0;
        self.utmrldbr = 0;
        self.utrl_run = false;
        self.utmrl_run = false;
        self.taken = 0;
        self.tm_taken = 0;
        self.parked = 0;
        self.phantom = 0;
        self.link = LinkModel::default();
        self.transfer_epoch.iter_mut().for_each(|e| *e += 1);
        self.task_epoch.iter_mut().for_each(|e| *e += 1);
    }

    fn take_work(&mut self) -> Option<Batch> {
        if !self.enabled {
            return None;
        }
        let lists = self.lists.clone()?;
        let transfers = if self.utrl_run {
            self.utrldbr & !self.taken & !self.phantom
        } else {
            0
        };
        let tasks = if self.utmrl_run {
            self.utmrldbr & !self.tm_taken
        } else {
            0
        };
        if transfers == 0 && tasks == 0 {
            return None;
        }
        self.taken |= transfers;
        self.tm_taken |= tasks;
        Some(Batch {
            lists,
            transfers: bits(transfers)
                .map(|tag| (tag, self.transfer_epoch[tag]))
                .collect(),
            tasks: bits(tasks).map(|tag| (tag, self.task_epoch[tag])).collect(),
        })
    }
}

struct Batch {
    lists: Arc<RequestLists>,
    transfers: Vec<(usize, u64)>,
    tasks: Vec<(usize, u64)>,
}

struct Shared {
    config: SimConfig,
    state: Mutex<SimState>,
    /// Signalled on every state change.
    cv: Condvar,
    device: Mutex<SimDevice>,
    clock_violations: AtomicU64,
}

impl Shared {
    fn raise(&self, st: &mut SimState, bits: u32) {
        st.is |= bits;
        st.irq_seq += 1;
        self.cv.notify_all();
    }

    fn touch(&self, st: &SimState, offset: u32) {
        if !st.clocks_on {
            self.clock_violations.fetch_add(1, Ordering::Relaxed);
            debug!(offset = format_args!("{offset:#x}"), "register access with clocks gated");
        }
    }

    fn slot_mask(&self) -> u32 {
        if self.config.transfer_slots >= 32 {
            u32::MAX
        } else {
            (1 << self.config.transfer_slots) - 1
        }
    }

    fn read_reg(&self, st: &mut SimState, offset: u32) -> u32 {
        match offset {
            REG_CONTROLLER_CAPABILITIES => Capabilities::encode(
                self.config.transfer_slots,
                self.config.task_slots,
                self.config.auto_hibern8,
            )
            .raw(),
            REG_UFS_VERSION => UFSHCI_VERSION,
            REG_AUTO_HIBERNATE_IDLE_TIMER => st.ahit,
            REG_INTERRUPT_STATUS => st.is,
            REG_INTERRUPT_ENABLE => st.ie,
            REG_CONTROLLER_STATUS => st.status(),
            REG_CONTROLLER_ENABLE => st.enabled as u32,
            REG_UIC_ERROR_CODE_PHY_ADAPTER_LAYER => std::mem::take(&mut st.uic_errors[0]),
            REG_UIC_ERROR_CODE_DATA_LINK_LAYER => std::mem::take(&mut st.uic_errors[1]),
            REG_UIC_ERROR_CODE_NETWORK_LAYER => std::mem::take(&mut st.uic_errors[2]),
            REG_UIC_ERROR_CODE_TRANSPORT_LAYER => std::mem::take(&mut st.uic_errors[3]),
            REG_UIC_ERROR_CODE_DME => std::mem::take(&mut st.uic_errors[4]),
            REG_UTP_TRANSFER_REQ_DOOR_BELL => st.utrldbr,
            REG_UTP_TRANSFER_REQ_LIST_RUN_STOP => st.utrl_run as u32,
            REG_UTP_TASK_REQ_DOOR_BELL => st.utmrldbr,
            REG_UTP_TASK_REQ_LIST_RUN_STOP => st.utmrl_run as u32,
            REG_UIC_COMMAND_ARG_1 => st.uic_args[0],
            REG_UIC_COMMAND_ARG_2 => st.uic_args[1],
            REG_UIC_COMMAND_ARG_3 => st.uic_args[2],
            _ => 0,
        }
    }

    fn write_reg(&self, st: &mut SimState, offset: u32, value: u32) {
        match offset {
            REG_AUTO_HIBERNATE_IDLE_TIMER => st.ahit = value,
            REG_INTERRUPT_STATUS => st.is &= !value,
            REG_INTERRUPT_ENABLE => {
                st.ie = value;
                st.irq_seq += 1;
            }
            REG_CONTROLLER_ENABLE => {
                if value & CONTROLLER_ENABLE != 0 {
                    if !st.enabled {
                        st.enabled = true;
                        st.enables += 1;
                        debug!("controller enabled");
                    }
                } else if st.enabled {
                    st.disable();
                    debug!("controller disabled");
                }
            }
            REG_UTP_TRANSFER_REQ_DOOR_BELL => {
                if !st.enabled || !st.utrl_run {
                    warn!(value, "transfer doorbell rung while list stopped");
                } else {
                    let rung = value & self.slot_mask() & !st.utrldbr;
                    for tag in bits(rung) {
                        st.transfer_epoch[tag] += 1;
                    }
                    st.utrldbr |= rung;
                }
            }
            REG_UTP_TRANSFER_REQ_LIST_CLEAR => {
                if st.faults.stuck_clear {
                    debug!(value = format_args!("{value:#x}"), "transfer clear ignored");
                } else {
                    let cleared = st.utrldbr & !value;
                    for tag in bits(cleared) {
                        st.transfer_epoch[tag] += 1;
                    }
                    st.utrldbr &= value;
                    st.taken &= value;
                    st.parked &= value;
                    st.phantom &= value;
                }
            }
            REG_UTP_TRANSFER_REQ_LIST_RUN_STOP => st.utrl_run = value & UTP_LIST_RUN != 0,
            REG_UTP_TASK_REQ_DOOR_BELL => {
                if !st.enabled || !st.utmrl_run {
                    warn!(value, "task doorbell rung while list stopped");
                } else {
                    let mask = (1u32 << self.config.task_slots) - 1;
                    let rung = value & mask & !st.utmrldbr;
                    for tag in bits(rung) {
                        st.task_epoch[tag] += 1;
                    }
                    st.utmrldbr |= rung;
                }
            }
            REG_UTP_TASK_REQ_LIST_CLEAR => {
                if !st.faults.stuck_clear {
                    let cleared = st.utmrldbr & !value;
                    for tag in bits(cleared) {
                        st.task_epoch[tag] += 1;
                    }
                    st.utmrldbr &= value;
                    st.tm_taken &= value;
                }
            }
            REG_UTP_TASK_REQ_LIST_RUN_STOP => st.utmrl_run = value & UTP_LIST_RUN != 0,
            REG_UIC_COMMAND_ARG_1 => st.uic_args[0] = value,
            REG_UIC_COMMAND_ARG_2 => st.uic_args[1] = value,
            REG_UIC_COMMAND_ARG_3 => st.uic_args[2] = value,
            REG_UIC_COMMAND => self.run_uic(st, value),
            _ => {}
        }
        self.cv.notify_all();
    }

    fn run_uic(&self, st: &mut SimState, raw: u32) {
        let code = raw as u8;
        *st.uic_counts.entry(code).or_default() += 1;
        if !st.enabled {
            warn!(opcode = code, "uic command while controller disabled");
            return;
        }
        let attr = (st.uic_args[0] >> 16) as u16;
        let mut power_bits = 0;
        let result = match UicOpcode::try_from(code) {
            Err(_) => UicResult::DmeFailure,
            Ok(UicOpcode::DmeLinkStartup) => {
                if st.faults.link_startup_failures > 0 {
                    st.faults.link_startup_failures -= 1;
                    debug!("link startup failed");
                    UicResult::DmeFailure
                } else {
                    st.link.start(&self.config);
                    debug!("link up");
                    UicResult::Success
                }
            }
            Ok(UicOpcode::DmeGet) => match st.link.local.get(&attr) {
                Some(&value) => {
                    st.uic_args[2] = value;
                    UicResult::Success
                }
                None => UicResult::InvalidMibAttribute,
            },
            Ok(UicOpcode::DmeSet) => {
                st.link.local.insert(attr, st.uic_args[2]);
                if attr == PA_PWRMODE {
                    let status = if st.link.up {
                        st.faults.power_mode_status.unwrap_or(PwrStatus::Local)
                    } else {
                        PwrStatus::FatalError
                    };
                    if status == PwrStatus::Local {
                        st.power_mode_changes += 1;
                    }
                    st.upmcrs = status.into();
                    power_bits = UIC_POWER_MODE;
                }
                UicResult::Success
            }
            Ok(UicOpcode::DmePeerGet) if st.link.up => match st.link.peer.get(&attr) {
                Some(&value) => {
                    st.uic_args[2] = value;
                    UicResult::Success
                }
                None => UicResult::InvalidMibAttribute,
            },
            Ok(UicOpcode::DmePeerSet) if st.link.up => {
                st.link.peer.insert(attr, st.uic_args[2]);
                UicResult::Success
            }
            Ok(UicOpcode::DmePeerGet | UicOpcode::DmePeerSet) => {
                UicResult::PeerCommunicationFailure
            }
            Ok(op @ (UicOpcode::DmeHibernEnter | UicOpcode::DmeHibernExit)) => {
                if !st.link.up {
                    UicResult::DmeFailure
                } else {
                    let enter = op == UicOpcode::DmeHibernEnter;
                    let injected = if enter {
                        st.faults.hibern8_enter_status
                    } else {
                        st.faults.hibern8_exit_status
                    };
                    let status = injected.unwrap_or(PwrStatus::Local);
                    if status == PwrStatus::Local {
                        st.link.hibern8 = enter;
                    }
                    st.upmcrs = status.into();
                    power_bits = if enter {
                        UIC_HIBERNATE_ENTER
                    } else {
                        UIC_HIBERNATE_EXIT
                    };
                    UicResult::Success
                }
            }
            Ok(_) => UicResult::Success,
        };
        trace!(opcode = code, attr, %result, "uic command");
        st.uic_args[1] = (st.uic_args[1] & !0xFF) | u8::from(result) as u32;
        self.raise(st, UIC_COMMAND_COMPL | power_bits);
    }

    fn run_tasks(&self, lists: &RequestLists, tasks: &[(usize, u64)]) {
        if tasks.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        let mut done = false;
        for &(tag, epoch) in tasks {
            let bit = 1 << tag;
            if st.task_epoch[tag] != epoch || st.utmrldbr & bit == 0 {
                continue;
            }
            {
                let mut slot = lists.task(tag);
                match TaskRequestUpiu::decode(&slot.request) {
                    Ok(req) => {
                        let service = st
                            .faults
                            .tm_response
                            .unwrap_or_else(|| st.task_service(&req));
                        slot.response = TaskResponse {
                            task_tag: req.task_tag,
                            response: 0,
                            service_response: service,
                            output_param2: 0,
                        }
                        .encode();
                        slot.descriptor.set_ocs(Ocs::Success);
                    }
                    Err(err) => {
                        warn!(tag, %err, "malformed task request");
                        slot.descriptor.set_ocs(Ocs::InvalidCmdTableAttr);
                    }
                }
            }
            st.utmrldbr &= !bit;
            st.tm_taken &= !bit;
            done = true;
        }
        if done {
            self.raise(&mut st, UTP_TASK_REQ_COMPL);
        }
    }

    fn run_transfers(&self, lists: &RequestLists, transfers: &[(usize, u64)]) {
        if transfers.is_empty() {
            return;
        }
        let requests: Vec<_> = transfers
            .iter()
            .map(|&(tag, epoch)| {
                let slot = lists.transfer(tag);
                (tag, epoch, slot.request.clone(), slot.data.clone())
            })
            .collect();

        let mut work = Vec::with_capacity(requests.len());
        {
            let mut st = self.state.lock();
            for (tag, epoch, request, data) in requests {
                if st.transfer_epoch[tag] != epoch {
                    continue;
                }
                match SimDevice::transaction(&request) {
                    Some(TransactionType::Command) if st.faults.stall => {
                        st.parked |= 1 << tag;
                        trace!(tag, "command stalled");
                    }
                    Some(TransactionType::NopOut) if st.faults.dropped_nops > 0 => {
                        st.faults.dropped_nops -= 1;
                        debug!(tag, "nop out dropped");
                    }
                    _ => work.push((tag, epoch, request, data)),
                }
            }
        }
        if work.is_empty() {
            return;
        }

        let answers: Vec<(usize, u64, Answer)> = {
            let mut device = self.device.lock();
            work.into_iter()
                .map(|(tag, epoch, request, data)| (tag, epoch, device.handle(&request, data)))
                .collect()
        };
        if !self.config.latency.is_zero() {
            thread::sleep(self.config.latency);
        }

        let mut st = self.state.lock();
        let mut done = false;
        for (tag, epoch, answer) in answers {
            let bit = 1 << tag;
            if st.transfer_epoch[tag] != epoch || st.utrldbr & bit == 0 {
                trace!(tag, "answer dropped, slot cleared meanwhile");
                continue;
            }
            {
                let mut slot = lists.transfer(tag);
                slot.descriptor.set_ocs(answer.ocs);
                let len = answer.response.len().min(RESPONSE_UPIU_MAX_LEN);
                slot.response[..len].copy_from_slice(&answer.response[..len]);
                if let Some(data) = answer.data {
                    slot.data = data;
                }
            }
            st.utrldbr &= !bit;
            st.taken &= !bit;
            done = true;
        }
        if done {
            self.raise(&mut st, UTP_TRANSFER_REQ_COMPL);
        }
    }
}

fn engine_loop(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    return;
                }
                if let Some(batch) = st.take_work() {
                    break batch;
                }
                shared.cv.wait(&mut st);
            }
        };
        shared.run_tasks(&batch.lists, &batch.tasks);
        shared.run_transfers(&batch.lists, &batch.transfers);
    }
}

fn irq_loop(shared: Arc<Shared>) {
    // Sequence number at which the host last found nothing to do.
    let mut quiet = None;
    loop {
        let (handle, seq) = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    return;
                }
                if st.is & st.ie != 0 && quiet != Some(st.irq_seq) {
                    if let Some(handle) = st.irq.clone() {
                        break (handle, st.irq_seq);
                    }
                }
                shared.cv.wait(&mut st);
            }
        };
        quiet = if handle.handle() { None } else { Some(seq) };
    }
}

/// A simulated UFS host controller and device.
pub struct SimController {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SimController {
    /// Build the controller and start its engine and interrupt threads. The controller
    /// starts disabled, as after power on.
    pub fn new(config: SimConfig) -> UfsResult<Arc<Self>> {
        let device = SimDevice::new(
            config.num_lu,
            config.blocks_per_lu,
            config.block_size,
            config.device_init_reads,
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::new(&config)),
            cv: Condvar::new(),
            device: Mutex::new(device),
            clock_violations: AtomicU64::new(0),
            config,
        });
        let controller = Arc::new(SimController {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(2)),
        });

        let engine_shared = Arc::clone(&shared);
        let engine = thread::Builder::new()
            .name("sim-engine".into())
            .spawn(move || engine_loop(engine_shared))
            .map_err(|source| UfsError::Spawn {
                name: "sim-engine",
                source,
            })?;
        controller.workers.lock().push(engine);

        let irq = thread::Builder::new()
            .name("sim-irq".into())
            .spawn(move || irq_loop(shared))
            .map_err(|source| UfsError::Spawn {
                name: "sim-irq",
                source,
            })?;
        controller.workers.lock().push(irq);
        Ok(controller)
    }

    /// Connect the interrupt line to a host.
    pub fn attach(&self, irq: IrqHandle) {
        let mut st = self.shared.state.lock();
        st.irq = Some(irq);
        st.irq_seq += 1;
        self.shared.cv.notify_all();
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut st = self.shared.state.lock();
        let result = f(&mut st);
        self.shared.cv.notify_all();
        result
    }

    /// Hold SCSI commands in the device. Clearing the fault lets held commands run.
    pub fn set_stall(&self, stall: bool) {
        self.with_state(|st| {
            st.faults.stall = stall;
            if !stall {
                st.taken &= !st.parked;
                st.parked = 0;
            }
        });
    }

    /// Make the list clear registers ignore writes.
    pub fn set_stuck_clear(&self, stuck: bool) {
        self.with_state(|st| st.faults.stuck_clear = stuck);
    }

    /// Fail the next `count` link startups.
    pub fn fail_link_startups(&self, count: u32) {
        self.with_state(|st| st.faults.link_startup_failures = count);
    }

    /// Leave the next `count` NOP OUT requests unanswered.
    pub fn drop_nops(&self, count: u32) {
        self.with_state(|st| st.faults.dropped_nops = count);
    }

    /// Answer every task management request with `response`, or restore normal answers.
    pub fn set_tm_response(&self, response: Option<TaskServiceResponse>) {
        self.with_state(|st| st.faults.tm_response = response);
    }

    pub fn set_hibern8_enter_status(&self, status: Option<PwrStatus>) {
        self.with_state(|st| st.faults.hibern8_enter_status = status);
    }

    pub fn set_hibern8_exit_status(&self, status: Option<PwrStatus>) {
        self.with_state(|st| st.faults.hibern8_exit_status = status);
    }

    pub fn set_power_mode_status(&self, status: Option<PwrStatus>) {
        self.with_state(|st| st.faults.power_mode_status = status);
    }

    /// Raise fatal interrupt status bits.
    pub fn inject_fatal(&self, bits: u32) {
        let mut st = self.shared.state.lock();
        debug!(bits = format_args!("{bits:#x}"), "injecting fatal error");
        self.shared.raise(&mut st, bits);
    }

    /// Latch UIC error codes and raise the UIC error interrupt.
    pub fn inject_uic_error(&self, errors: UicErrorInjection) {
        let mut st = self.shared.state.lock();
        let layers = [
            (errors.pa, UIC_PHY_ADAPTER_LAYER_ERROR),
            (errors.dl, UIC_DATA_LINK_LAYER_ERROR),
            (errors.nl, UIC_NETWORK_LAYER_ERROR),
            (errors.tl, UIC_TRANSPORT_LAYER_ERROR),
            (errors.dme, UIC_DME_ERROR),
        ];
        for (reg, (code, valid)) in st.uic_errors.iter_mut().zip(layers) {
            if code != 0 {
                *reg = valid | code;
            }
        }
        debug!(?errors, "injecting uic error");
        self.shared.raise(&mut st, UIC_ERROR);
    }

    /// Set the doorbell bit of a slot nobody issued and report a transfer completion.
    pub fn inject_desync(&self, tag: usize) {
        let mut st = self.shared.state.lock();
        let bit = 1 << tag;
        st.utrldbr |= bit;
        st.phantom |= bit;
        self.shared.raise(&mut st, UTP_TRANSFER_REQ_COMPL);
    }

    /// Report a hibernate transition as the auto-hibernate timer would.
    pub fn raise_auto_hibern8(&self, enter: bool, status: PwrStatus) {
        let mut st = self.shared.state.lock();
        st.upmcrs = status.into();
        if status == PwrStatus::Local {
            st.link.hibern8 = enter;
        }
        let bit = if enter {
            UIC_HIBERNATE_ENTER
        } else {
            UIC_HIBERNATE_EXIT
        };
        self.shared.raise(&mut st, bit);
    }

    pub(crate) fn set_clocks(&self, on: bool) {
        self.with_state(|st| st.clocks_on = on);
    }

    pub(crate) fn reset_device(&self) {
        self.shared.device.lock().reset();
    }

    /// Register accesses made while the clocks were gated.
    pub fn clock_violations(&self) -> u64 {
        self.shared.clock_violations.load(Ordering::Relaxed)
    }

    pub fn clocks_on(&self) -> bool {
        self.shared.state.lock().clocks_on
    }

    /// UIC commands written with `opcode`.
    pub fn uic_count(&self, opcode: UicOpcode) -> u64 {
        self.shared
            .state
            .lock()
            .uic_counts
            .get(&(opcode as u8))
            .copied()
            .unwrap_or(0)
    }

    /// Every UIC command written so far.
    pub fn uic_total(&self) -> u64 {
        self.shared.state.lock().uic_counts.values().sum()
    }

    /// Successful PA_PWRMODE changes.
    pub fn power_mode_changes(&self) -> u64 {
        self.shared.state.lock().power_mode_changes
    }

    pub fn link_up(&self) -> bool {
        self.shared.state.lock().link.up
    }

    pub fn link_hibern8(&self) -> bool {
        self.shared.state.lock().link.hibern8
    }

    /// Times the controller went from disabled to enabled.
    pub fn enables(&self) -> u64 {
        self.shared.state.lock().enables
    }

    pub fn transfer_doorbell(&self) -> u32 {
        self.shared.state.lock().utrldbr
    }

    /// Commands currently held by the stall fault.
    pub fn stalled(&self) -> u32 {
        self.shared.state.lock().parked.count_ones()
    }

    pub fn auto_hibern8_timer(&self) -> u32 {
        self.shared.state.lock().ahit
    }

    pub fn device_power_mode(&self) -> DevicePowerMode {
        self.shared.device.lock().power_mode()
    }

    pub fn device_resets(&self) -> u64 {
        self.shared.device.lock().resets()
    }

    /// NOP OUT requests the device answered.
    pub fn nops_answered(&self) -> u64 {
        self.shared.device.lock().nops()
    }

    /// Wait until `count` commands are held by the stall fault.
    pub fn wait_stalled(&self, count: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        while st.parked.count_ones() < count {
            if self.shared.cv.wait_until(&mut st, deadline).timed_out() {
                return st.parked.count_ones() >= count;
            }
        }
        true
    }
}

impl HostRegisters for SimController {
    fn read(&self, offset: u32) -> u32 {
        let mut st = self.shared.state.lock();
        self.shared.touch(&st, offset);
        self.shared.read_reg(&mut st, offset)
    }

    fn write(&self, offset: u32, value: u32) {
        let mut st = self.shared.state.lock();
        self.shared.touch(&st, offset);
        self.shared.write_reg(&mut st, offset, value);
    }

    fn bind_request_lists(&self, lists: Arc<RequestLists>) {
        let mut st = self.shared.state.lock();
        st.lists = Some(lists);
        self.shared.cv.notify_all();
    }

    fn wait(&self, offset: u32, mask: u32, value: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        self.shared.touch(&st, offset);
        loop {
            if self.shared.read_reg(&mut st, offset) & mask == value {
                return true;
            }
            if self.shared.cv.wait_until(&mut st, deadline).timed_out() {
                return self.shared.read_reg(&mut st, offset) & mask == value;
            }
        }
    }
}

impl Drop for SimController {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            st.irq = None;
            self.shared.cv.notify_all();
        }
        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Arc<SimController> {
        SimController::new(SimConfig {
            transfer_slots: 8,
            task_slots: 4,
            ..SimConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn capabilities_reflect_config() {
        let sim = controller();
        let caps = Capabilities::from_raw(sim.read(REG_CONTROLLER_CAPABILITIES));
        assert_eq!(caps.transfer_slots(), 8);
        assert_eq!(caps.task_slots(), 4);
        assert!(caps.auto_hibern8());
    }

    #[test]
    fn interrupt_status_is_write_one_to_clear() {
        let sim = controller();
        sim.inject_fatal(0b101);
        sim.write(REG_INTERRUPT_STATUS, 0b001);
        assert_eq!(sim.read(REG_INTERRUPT_STATUS), 0b100);
    }

    #[test]
    fn uic_link_startup_reports_device_present() {
        let sim = controller();
        sim.write(REG_CONTROLLER_ENABLE, CONTROLLER_ENABLE);
        assert_ne!(sim.read(REG_CONTROLLER_STATUS) & UIC_COMMAND_READY, 0);
        sim.write(REG_UIC_COMMAND, UicOpcode::DmeLinkStartup as u32);
        assert_eq!(UicResult::from_arg2(sim.read(REG_UIC_COMMAND_ARG_2)), UicResult::Success);
        assert_ne!(sim.read(REG_CONTROLLER_STATUS) & DEVICE_PRESENT, 0);
        assert_ne!(sim.read(REG_INTERRUPT_STATUS) & UIC_COMMAND_COMPL, 0);
    }

    #[test]
    fn failed_link_startup_leaves_device_absent() {
        let sim = controller();
        sim.fail_link_startups(1);
        sim.write(REG_CONTROLLER_ENABLE, CONTROLLER_ENABLE);
        sim.write(REG_UIC_COMMAND, UicOpcode::DmeLinkStartup as u32);
        assert_eq!(
            UicResult::from_arg2(sim.read(REG_UIC_COMMAND_ARG_2)),
            UicResult::DmeFailure
        );
        assert_eq!(sim.read(REG_CONTROLLER_STATUS) & DEVICE_PRESENT, 0);
    }

    #[test]
    fn disable_drops_doorbells_and_link() {
        let sim = controller();
        sim.write(REG_CONTROLLER_ENABLE, CONTROLLER_ENABLE);
        sim.write(REG_UIC_COMMAND, UicOpcode::DmeLinkStartup as u32);
        sim.inject_desync(2);
        assert_eq!(sim.transfer_doorbell(), 1 << 2);
        sim.write(REG_CONTROLLER_ENABLE, 0);
        assert_eq!(sim.transfer_doorbell(), 0);
        assert!(!sim.link_up());
        assert_eq!(sim.read(REG_CONTROLLER_STATUS), 0);
    }

    #[test]
    fn gated_access_is_counted() {
        let sim = controller();
        sim.set_clocks(false);
        sim.read(REG_CONTROLLER_STATUS);
        sim.set_clocks(true);
        sim.read(REG_CONTROLLER_STATUS);
        assert_eq!(sim.clock_violations(), 1);
    }
}
