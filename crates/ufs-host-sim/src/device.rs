//! Device side of the simulation: logical units, flags, attributes and descriptors.

use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use tracing::{debug, trace};
use ufs_host_core::DevicePowerMode;
use ufs_proto::{
    upiu::{
        desc, flag, scsi, wlun, RESPONSE_UPIU_MAX_LEN, SENSE_BUFFER_LEN,
        UPIU_RESPONSE_TARGET_SUCCESS,
    },
    CommandUpiu, Ocs, QueryOpcode, QueryRequestUpiu, QueryResponse, QueryResponseCode,
    ResponseUpiu, TransactionType, UpiuHeader,
};

const SENSE_NOT_READY: u8 = 0x02;
const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
const ASC_NOT_READY: u8 = 0x04;
const ASC_INVALID_OPCODE: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
const ASC_LU_NOT_SUPPORTED: u8 = 0x25;

const MANUFACTURER_ID: u16 = 0x0BAD;
const SPEC_VERSION: u16 = 0x0310;
const QUEUE_DEPTH: u8 = 32;
const NUM_WLU: u8 = 4;

/// What the device made of one transfer request.
pub(crate) struct Answer {
    pub(crate) ocs: Ocs,
    pub(crate) response: Vec<u8>,
    /// Inbound payload for reads.
    pub(crate) data: Option<Vec<u8>>,
}

impl Answer {
    fn ocs(ocs: Ocs) -> Self {
        Self {
            ocs,
            response: Vec::new(),
            data: None,
        }
    }
}

pub(crate) struct SimDevice {
    block_size: u32,
    units: Vec<Vec<u8>>,
    power_mode: DevicePowerMode,
    flags: [bool; 16],
    /// Reads of `fDeviceInit` left before the device reports init done.
    init_reads_left: u32,
    init_reads: u32,
    attributes: HashMap<(u8, u8, u8), u32>,
    config_descriptor: Vec<u8>,
    resets: u64,
    nops: u64,
}

impl SimDevice {
    pub(crate) fn new(num_lu: u8, blocks_per_lu: u32, block_size: u32, init_reads: u32) -> Self {
        let lu_bytes = blocks_per_lu as usize * block_size as usize;
        Self {
            block_size,
            units: (0..num_lu).map(|_| vec![0; lu_bytes]).collect(),
            power_mode: DevicePowerMode::Active,
            flags: [false; 16],
            init_reads_left: 0,
            init_reads,
            attributes: HashMap::new(),
            config_descriptor: vec![0; 0x90],
            resets: 0,
            nops: 0,
        }
    }

    pub(crate) fn power_mode(&self) -> DevicePowerMode {
        self.power_mode
    }

    pub(crate) fn resets(&self) -> u64 {
        self.resets
    }

    pub(crate) fn nops(&self) -> u64 {
        self.nops
    }

    /// Hardware reset: volatile state goes, media stays.
    pub(crate) fn reset(&mut self) {
        self.power_mode = DevicePowerMode::Active;
        self.flags = [false; 16];
        self.init_reads_left = 0;
        self.attributes.clear();
        self.resets += 1;
        debug!("device reset");
    }

    fn device_descriptor(&self) -> Vec<u8> {
        let mut d = vec![0u8; desc::DEVICE_DESC_LEN];
        d[desc::DEVICE_PARAM_LEN] = desc::DEVICE_DESC_LEN as u8;
        d[desc::DEVICE_PARAM_TYPE] = desc::DEVICE;
        d[desc::DEVICE_PARAM_NUM_LU] = self.units.len() as u8;
        d[desc::DEVICE_PARAM_NUM_WLU] = NUM_WLU;
        BigEndian::write_u16(&mut d[desc::DEVICE_PARAM_SPEC_VER..], SPEC_VERSION);
        BigEndian::write_u16(&mut d[desc::DEVICE_PARAM_MANF_ID..], MANUFACTURER_ID);
        d[desc::DEVICE_PARAM_Q_DPTH] = QUEUE_DEPTH;
        d
    }

    /// Peek at a request's transaction type without handling it.
    pub(crate) fn transaction(request: &[u8]) -> Option<TransactionType> {
        UpiuHeader::decode(request).ok()?.transaction().ok()
    }

    pub(crate) fn handle(&mut self, request: &[u8], data: Vec<u8>) -> Answer {
        let header = match UpiuHeader::decode(request) {
            Ok(header) => header,
            Err(_) => return Answer::ocs(Ocs::InvalidCmdTableAttr),
        };
        match header.transaction() {
            Ok(TransactionType::NopOut) => {
                self.nops += 1;
                let mut response = vec![0u8; ufs_proto::upiu::UPIU_BASE_LEN];
                UpiuHeader::new(TransactionType::NopIn, header.task_tag).encode_into(&mut response);
                Answer {
                    ocs: Ocs::Success,
                    response,
                    data: None,
                }
            }
            Ok(TransactionType::Command) => match CommandUpiu::decode(request) {
                Ok(cmd) => self.scsi(&cmd, data),
                Err(_) => Answer::ocs(Ocs::InvalidCmdTableAttr),
            },
            Ok(TransactionType::QueryReq) => match QueryRequestUpiu::decode(request) {
                Ok(query) => self.query(&query, &request[ufs_proto::upiu::UPIU_BASE_LEN..]),
                Err(_) => Answer::ocs(Ocs::InvalidCmdTableAttr),
            },
            _ => Answer::ocs(Ocs::InvalidCmdTableAttr),
        }
    }

    fn scsi(&mut self, cmd: &CommandUpiu, data: Vec<u8>) -> Answer {
        trace!(lun = cmd.lun, opcode = cmd.cdb[0], "scsi command");
        if cmd.lun == wlun::UFS_DEVICE {
            return match cmd.cdb[0] {
                scsi::START_STOP_UNIT => {
                    self.power_mode = match cmd.cdb[4] >> 4 {
                        scsi::POWER_CONDITION_ACTIVE => DevicePowerMode::Active,
                        scsi::POWER_CONDITION_SLEEP => DevicePowerMode::Sleep,
                        scsi::POWER_CONDITION_POWERDOWN => DevicePowerMode::PowerDown,
                        _ => return check_condition(cmd.task_tag, SENSE_ILLEGAL_REQUEST, 0x24),
                    };
                    debug!(mode = %self.power_mode, "device power mode changed");
                    good(cmd.task_tag, None)
                }
                scsi::TEST_UNIT_READY => good(cmd.task_tag, None),
                _ => check_condition(cmd.task_tag, SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE),
            };
        }
        let lun = cmd.lun as usize;
        if lun >= self.units.len() {
            return check_condition(cmd.task_tag, SENSE_ILLEGAL_REQUEST, ASC_LU_NOT_SUPPORTED);
        }
        if self.power_mode != DevicePowerMode::Active {
            return check_condition(cmd.task_tag, SENSE_NOT_READY, ASC_NOT_READY);
        }
        match cmd.cdb[0] {
            scsi::TEST_UNIT_READY => good(cmd.task_tag, None),
            op @ (scsi::READ_10 | scsi::WRITE_10) => {
                let lba = BigEndian::read_u32(&cmd.cdb[2..6]) as usize;
                let blocks = BigEndian::read_u16(&cmd.cdb[7..9]) as usize;
                let block_size = self.block_size as usize;
                let unit = &mut self.units[lun];
                let start = lba * block_size;
                let end = start + blocks * block_size;
                if end > unit.len() {
                    return check_condition(
                        cmd.task_tag,
                        SENSE_ILLEGAL_REQUEST,
                        ASC_LBA_OUT_OF_RANGE,
                    );
                }
                if end - start != cmd.expected_len as usize {
                    return Answer::ocs(Ocs::MismatchDataBufSize);
                }
                if op == scsi::READ_10 {
                    good(cmd.task_tag, Some(unit[start..end].to_vec()))
                } else {
                    if data.len() != end - start {
                        return Answer::ocs(Ocs::MismatchDataBufSize);
                    }
                    unit[start..end].copy_from_slice(&data);
                    good(cmd.task_tag, None)
                }
            }
            _ => check_condition(cmd.task_tag, SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE),
        }
    }

    fn query(&mut self, req: &QueryRequestUpiu, outbound: &[u8]) -> Answer {
        let mut rsp = QueryResponse {
            task_tag: req.task_tag,
            response: QueryResponseCode::Success,
            opcode: req.opcode as u8,
            idn: req.idn,
            index: req.index,
            selector: req.selector,
            length: 0,
            value: 0,
            data_segment_len: 0,
        };
        let mut data = Vec::new();
        match req.opcode {
            QueryOpcode::Nop => {}
            QueryOpcode::ReadFlag
            | QueryOpcode::SetFlag
            | QueryOpcode::ClearFlag
            | QueryOpcode::ToggleFlag => match self.flags.get_mut(req.idn as usize) {
                None => rsp.response = QueryResponseCode::InvalidIdn,
                Some(value) => {
                    match req.opcode {
                        QueryOpcode::SetFlag => *value = true,
                        QueryOpcode::ClearFlag => *value = false,
                        QueryOpcode::ToggleFlag => *value = !*value,
                        _ => {}
                    }
                    if req.idn == flag::DEVICE_INIT {
                        if req.opcode == QueryOpcode::SetFlag {
                            self.init_reads_left = self.init_reads;
                        } else if req.opcode == QueryOpcode::ReadFlag {
                            if self.init_reads_left == 0 {
                                *value = false;
                            } else {
                                self.init_reads_left -= 1;
                            }
                        }
                    }
                    rsp.value = *value as u32;
                }
            },
            QueryOpcode::ReadAttr => {
                rsp.value = self
                    .attributes
                    .get(&(req.idn, req.index, req.selector))
                    .copied()
                    .unwrap_or(0);
            }
            QueryOpcode::WriteAttr => {
                self.attributes
                    .insert((req.idn, req.index, req.selector), req.value);
                rsp.value = req.value;
            }
            QueryOpcode::ReadDesc => {
                let descriptor = match req.idn {
                    desc::DEVICE => Some(self.device_descriptor()),
                    desc::CONFIGURATION => Some(self.config_descriptor.clone()),
                    _ => None,
                };
                match descriptor {
                    Some(mut descriptor) => {
                        descriptor.truncate(req.length as usize);
                        rsp.length = descriptor.len() as u16;
                        data = descriptor;
                    }
                    None => rsp.response = QueryResponseCode::InvalidIdn,
                }
            }
            QueryOpcode::WriteDesc => {
                if req.idn != desc::CONFIGURATION {
                    rsp.response = QueryResponseCode::NotWriteable;
                } else if req.length as usize > outbound.len()
                    || req.length as usize > self.config_descriptor.len()
                {
                    rsp.response = QueryResponseCode::InvalidLength;
                } else {
                    let len = req.length as usize;
                    self.config_descriptor[..len].copy_from_slice(&outbound[..len]);
                    rsp.length = req.length;
                }
            }
        }
        let mut response = vec![0u8; RESPONSE_UPIU_MAX_LEN];
        let len = rsp.encode_into(&mut response, &data);
        response.truncate(len);
        Answer {
            ocs: Ocs::Success,
            response,
            data: None,
        }
    }
}

fn good(task_tag: u8, data: Option<Vec<u8>>) -> Answer {
    let mut response = vec![0u8; RESPONSE_UPIU_MAX_LEN];
    let len = ResponseUpiu::success(task_tag).encode_into(&mut response);
    response.truncate(len);
    Answer {
        ocs: Ocs::Success,
        response,
        data,
    }
}

fn check_condition(task_tag: u8, key: u8, asc: u8) -> Answer {
    let mut sense = [0u8; SENSE_BUFFER_LEN];
    sense[0] = 0x70;
    sense[2] = key;
    sense[7] = (SENSE_BUFFER_LEN - 8) as u8;
    sense[12] = asc;
    let upiu = ResponseUpiu {
        response: UPIU_RESPONSE_TARGET_SUCCESS,
        status: scsi::STATUS_CHECK_CONDITION,
        sense_len: SENSE_BUFFER_LEN as u16,
        sense,
        ..ResponseUpiu::success(task_tag)
    };
    let mut response = vec![0u8; RESPONSE_UPIU_MAX_LEN];
    let len = upiu.encode_into(&mut response);
    response.truncate(len);
    Answer {
        ocs: Ocs::Success,
        response,
        data: None,
    }
}
