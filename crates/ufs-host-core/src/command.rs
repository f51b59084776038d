//! Commands accepted from the upper layer and the results reported back.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use ufs_proto::{
    upiu::{scsi, wlun, UPIU_RESPONSE_TARGET_SUCCESS},
    DataDirection, Ocs, ProtoError, ResponseUpiu, TransactionType,
};

/// A SCSI command bound for one logical unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiCommand {
    pub lun: u8,
    pub cdb: [u8; 16],
    pub direction: DataDirection,
    /// Bytes expected to move in either direction.
    pub transfer_len: u32,
    /// Outbound payload for writes.
    pub data: Vec<u8>,
}

impl ScsiCommand {
    /// A command without a data phase.
    pub fn new(lun: u8, cdb: &[u8]) -> Self {
        let mut buf = [0u8; 16];
        let len = cdb.len().min(16);
        buf[..len].copy_from_slice(&cdb[..len]);
        Self {
            lun,
            cdb: buf,
            direction: DataDirection::None,
            transfer_len: 0,
            data: Vec::new(),
        }
    }

    pub fn read(lun: u8, cdb: &[u8], transfer_len: u32) -> Self {
        Self {
            direction: DataDirection::DeviceToHost,
            transfer_len,
            ..Self::new(lun, cdb)
        }
    }

    pub fn write(lun: u8, cdb: &[u8], data: Vec<u8>) -> Self {
        Self {
            direction: DataDirection::HostToDevice,
            transfer_len: data.len() as u32,
            data,
            ..Self::new(lun, cdb)
        }
    }

    pub fn test_unit_ready(lun: u8) -> Self {
        Self::new(lun, &[scsi::TEST_UNIT_READY])
    }

    pub fn read10(lun: u8, lba: u32, blocks: u16, block_size: u32) -> Self {
        let mut cdb = [0u8; 10];
        cdb[0] = scsi::READ_10;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        Self::read(lun, &cdb, blocks as u32 * block_size)
    }

    /// WRITE(10) of `data`, which must be a whole number of blocks.
    pub fn write10(lun: u8, lba: u32, data: Vec<u8>, block_size: u32) -> Self {
        let mut cdb = [0u8; 10];
        cdb[0] = scsi::WRITE_10;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        let blocks = (data.len() as u32 / block_size.max(1)) as u16;
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        Self::write(lun, &cdb, data)
    }

    /// START STOP UNIT to the device well-known LU, changing the device power mode.
    pub fn start_stop_unit(power_condition: u8) -> Self {
        let mut cdb = [0u8; 6];
        cdb[0] = scsi::START_STOP_UNIT;
        cdb[4] = power_condition << 4;
        Self::new(wlun::UFS_DEVICE, &cdb)
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }
}

/// Device response to a SCSI command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScsiResponse {
    /// UPIU response code.
    pub response: u8,
    /// SCSI status.
    pub status: u8,
    pub residual: u32,
    pub sense: Vec<u8>,
    /// Inbound payload for reads.
    pub data: Vec<u8>,
}

/// Terminal result of a submitted command. Exactly one is reported per command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResult {
    Good(ScsiResponse),
    /// Device answered with a non-GOOD status or a target failure.
    DeviceError(ScsiResponse),
    /// Controller reported an overall command status other than success.
    Ocs(Ocs),
    /// No completion within the allotted time; the command was withdrawn.
    Timeout,
    /// Withdrawn by `cancel`.
    Aborted,
    /// Withdrawn by recovery; the caller should resubmit.
    Requeue,
    /// Response UPIU could not be decoded.
    Malformed(ProtoError),
}

impl CommandResult {
    pub fn is_good(&self) -> bool {
        matches!(self, CommandResult::Good(_))
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            CommandResult::Good(resp) => Some(&resp.data),
            _ => None,
        }
    }

    pub(crate) fn decode(ocs: Ocs, response: &[u8], data: Vec<u8>) -> Self {
        if ocs != Ocs::Success {
            return CommandResult::Ocs(ocs);
        }
        let upiu = match ResponseUpiu::decode(response) {
            Ok(upiu) => upiu,
            Err(err) => return CommandResult::Malformed(err),
        };
        if upiu.transaction_type != TransactionType::Response as u8 {
            return CommandResult::Malformed(ProtoError::UnexpectedTransaction {
                expected: TransactionType::Response as u8,
                actual: upiu.transaction_type,
            });
        }
        let resp = ScsiResponse {
            response: upiu.response,
            status: upiu.status,
            residual: upiu.residual,
            sense: upiu.sense().to_vec(),
            data,
        };
        if upiu.response == UPIU_RESPONSE_TARGET_SUCCESS && upiu.status == scsi::STATUS_GOOD {
            CommandResult::Good(resp)
        } else {
            CommandResult::DeviceError(resp)
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Good(_) => f.write_str("good"),
            CommandResult::DeviceError(resp) => {
                write!(f, "device error (status {:#04x})", resp.status)
            }
            CommandResult::Ocs(ocs) => write!(f, "ocs {ocs}"),
            CommandResult::Timeout => f.write_str("timeout"),
            CommandResult::Aborted => f.write_str("aborted"),
            CommandResult::Requeue => f.write_str("requeue"),
            CommandResult::Malformed(err) => write!(f, "malformed response: {err}"),
        }
    }
}

/// Identifies one submitted command for `cancel`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    pub(crate) tag: usize,
    pub(crate) id: u64,
    pub(crate) lun: u8,
}

impl CommandHandle {
    /// Transfer slot the command occupies.
    pub fn tag(&self) -> usize {
        self.tag
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The command was withdrawn and reported as aborted.
    Aborted,
    /// The command had already completed; its own result was reported.
    AlreadyCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufs_proto::upiu::{RESPONSE_UPIU_MAX_LEN, UPIU_RESPONSE_TARGET_FAILURE};

    #[test]
    fn read10_cdb_layout() {
        let cmd = ScsiCommand::read10(1, 0x0102_0304, 8, 4096);
        assert_eq!(&cmd.cdb[..10], &[0x28, 0, 1, 2, 3, 4, 0, 0, 8, 0]);
        assert_eq!(cmd.transfer_len, 8 * 4096);
        assert_eq!(cmd.direction, DataDirection::DeviceToHost);
    }

    #[test]
    fn start_stop_targets_device_wlun() {
        let cmd = ScsiCommand::start_stop_unit(scsi::POWER_CONDITION_SLEEP);
        assert_eq!(cmd.lun, wlun::UFS_DEVICE);
        assert_eq!(cmd.cdb[4], 0x20);
    }

    #[test]
    fn decode_distinguishes_outcomes() {
        assert_eq!(
            CommandResult::decode(Ocs::Aborted, &[], Vec::new()),
            CommandResult::Ocs(Ocs::Aborted)
        );

        let mut buf = [0u8; RESPONSE_UPIU_MAX_LEN];
        ResponseUpiu::success(3).encode_into(&mut buf);
        let good = CommandResult::decode(Ocs::Success, &buf, vec![1, 2]);
        assert_eq!(good.data(), Some(&[1u8, 2][..]));

        let mut failed = ResponseUpiu::success(3);
        failed.response = UPIU_RESPONSE_TARGET_FAILURE;
        failed.encode_into(&mut buf);
        assert!(matches!(
            CommandResult::decode(Ocs::Success, &buf, Vec::new()),
            CommandResult::DeviceError(_)
        ));

        assert!(matches!(
            CommandResult::decode(Ocs::Success, &[0u8; 8], Vec::new()),
            CommandResult::Malformed(ProtoError::Truncated { .. })
        ));
    }
}
