//! Per-slot request memory shared with the controller.
//!
//! Each transfer slot carries its descriptor header, the request UPIU, room for the response
//! UPIU and a data buffer standing in for the PRDT. The host writes a slot before ringing its
//! doorbell and reads it back after the doorbell bit drops; the controller only touches a slot
//! while its doorbell bit is set.

use parking_lot::{Mutex, MutexGuard};
use ufs_proto::{
    upiu::{RESPONSE_UPIU_MAX_LEN, UPIU_BASE_LEN},
    DataDirection, Ocs, UtpCommandType, UtpTaskDescriptor, UtpTransferDescriptor,
};

pub struct TransferSlot {
    pub descriptor: UtpTransferDescriptor,
    /// Request UPIU plus any outbound data segment.
    pub request: Vec<u8>,
    pub response: [u8; RESPONSE_UPIU_MAX_LEN],
    /// Data buffer for SCSI reads and writes.
    pub data: Vec<u8>,
}

impl TransferSlot {
    fn new() -> Self {
        Self {
            descriptor: UtpTransferDescriptor::default(),
            request: Vec::with_capacity(UPIU_BASE_LEN),
            response: [0; RESPONSE_UPIU_MAX_LEN],
            data: Vec::new(),
        }
    }

    /// Reset the slot for a new request. The OCS is left as "invalid" so a slot the controller
    /// never processed can be told apart from a completed one.
    pub fn prepare(&mut self, command_type: UtpCommandType, direction: DataDirection) {
        self.descriptor = UtpTransferDescriptor::new(command_type, direction);
        self.request.clear();
        self.response.fill(0);
        self.data.clear();
    }
}

pub struct TaskSlot {
    pub descriptor: UtpTaskDescriptor,
    pub request: [u8; UPIU_BASE_LEN],
    pub response: [u8; UPIU_BASE_LEN],
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            descriptor: UtpTaskDescriptor::new(),
            request: [0; UPIU_BASE_LEN],
            response: [0; UPIU_BASE_LEN],
        }
    }

    pub fn prepare(&mut self) {
        self.descriptor = UtpTaskDescriptor::new();
        self.request.fill(0);
        self.response.fill(0);
    }
}

/// Transfer and task request lists of one controller.
pub struct RequestLists {
    transfer: Vec<Mutex<TransferSlot>>,
    task: Vec<Mutex<TaskSlot>>,
}

impl RequestLists {
    pub fn new(transfer_slots: usize, task_slots: usize) -> Self {
        Self {
            transfer: (0..transfer_slots)
                .map(|_| Mutex::new(TransferSlot::new()))
                .collect(),
            task: (0..task_slots).map(|_| Mutex::new(TaskSlot::new())).collect(),
        }
    }

    pub fn transfer_slots(&self) -> usize {
        self.transfer.len()
    }

    pub fn task_slots(&self) -> usize {
        self.task.len()
    }

    /// Lock one transfer slot. Panics if `tag` is outside the list.
    pub fn transfer(&self, tag: usize) -> MutexGuard<'_, TransferSlot> {
        self.transfer[tag].lock()
    }

    /// Lock one task slot. Panics if `tag` is outside the list.
    pub fn task(&self, tag: usize) -> MutexGuard<'_, TaskSlot> {
        self.task[tag].lock()
    }

    /// Overall command status currently recorded for a transfer slot.
    pub fn transfer_ocs(&self, tag: usize) -> Ocs {
        self.transfer[tag].lock().descriptor.ocs()
    }
}
