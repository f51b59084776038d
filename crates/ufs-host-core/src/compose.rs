//! Builds request UPIUs into per-slot request memory.

use crate::{command::ScsiCommand, host::Inner};
use ufs_proto::{
    upiu::{UPIU_CMD_FLAGS_NONE, UPIU_CMD_FLAGS_READ, UPIU_CMD_FLAGS_WRITE},
    CommandUpiu, DataDirection, NopOutUpiu, QueryRequestUpiu, UtpCommandType,
};

pub(crate) enum Request<'a> {
    Scsi(&'a ScsiCommand),
    Nop,
    Query {
        upiu: QueryRequestUpiu,
        /// Outbound data segment for descriptor writes.
        data: &'a [u8],
    },
}

impl Request<'_> {
    pub(crate) fn direction(&self) -> DataDirection {
        match self {
            Request::Scsi(cmd) => cmd.direction,
            Request::Nop | Request::Query { .. } => DataDirection::None,
        }
    }
}

fn upiu_flags(direction: DataDirection) -> u8 {
    match direction {
        DataDirection::None => UPIU_CMD_FLAGS_NONE,
        DataDirection::HostToDevice => UPIU_CMD_FLAGS_WRITE,
        DataDirection::DeviceToHost => UPIU_CMD_FLAGS_READ,
    }
}

impl Inner {
    /// Write `request` into slot `tag`. The slot must be owned by the caller and not
    /// outstanding.
    pub(crate) fn compose(&self, tag: usize, request: &Request<'_>) {
        let task_tag = tag as u8;
        let mut slot = self.lists.transfer(tag);
        match request {
            Request::Scsi(cmd) => {
                slot.prepare(UtpCommandType::UfsStorage, cmd.direction);
                let upiu = CommandUpiu {
                    lun: cmd.lun,
                    task_tag,
                    flags: upiu_flags(cmd.direction),
                    expected_len: cmd.transfer_len,
                    cdb: cmd.cdb,
                };
                slot.request.extend_from_slice(&upiu.encode());
                match cmd.direction {
                    DataDirection::HostToDevice => slot.data.extend_from_slice(&cmd.data),
                    DataDirection::DeviceToHost => slot.data.resize(cmd.transfer_len as usize, 0),
                    DataDirection::None => {}
                }
            }
            Request::Nop => {
                slot.prepare(UtpCommandType::DevManage, DataDirection::None);
                slot.request
                    .extend_from_slice(&NopOutUpiu { task_tag }.encode());
            }
            Request::Query { upiu, data } => {
                slot.prepare(UtpCommandType::DevManage, DataDirection::None);
                let upiu = QueryRequestUpiu { task_tag, ..*upiu };
                slot.request.extend_from_slice(&upiu.encode());
                slot.request.extend_from_slice(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_direction() {
        assert_eq!(upiu_flags(DataDirection::DeviceToHost), UPIU_CMD_FLAGS_READ);
        assert_eq!(upiu_flags(DataDirection::HostToDevice), UPIU_CMD_FLAGS_WRITE);
        assert_eq!(upiu_flags(DataDirection::None), UPIU_CMD_FLAGS_NONE);
    }

    #[test]
    fn device_management_requests_move_no_data() {
        let cmd = ScsiCommand::read10(0, 0, 1, 512);
        assert_eq!(Request::Scsi(&cmd).direction(), DataDirection::DeviceToHost);
        assert_eq!(Request::Nop.direction(), DataDirection::None);
    }
}
