//! Device management commands on the reserved slot: NOP OUT and query requests.

use crate::{
    compose::Request,
    dispatch::Admission,
    error::{UfsError, UfsResult},
    host::{Completion, Inner, Retirement},
};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};
use ufs_proto::{
    upiu::UPIU_BASE_LEN, Ocs, QueryOpcode, QueryRequestUpiu, QueryResponse, QueryResponseCode,
    TransactionType, UpiuHeader,
};

fn fatal_for_retry(err: &UfsError) -> bool {
    matches!(
        err,
        UfsError::Busy(_) | UfsError::HostFailed | UfsError::Suspended | UfsError::Interrupted
    )
}

impl Inner {
    /// Run one device management command and return the raw response UPIU.
    fn exec_dev_cmd(
        &self,
        request: Request<'_>,
        expected: TransactionType,
        timeout: Duration,
        admission: Admission,
    ) -> UfsResult<Vec<u8>> {
        self.admit_now(admission)?;
        let slot = self.dev_slots.acquire()?;
        let (tx, rx) = bounded(1);
        let handle = self.issue(
            slot,
            request,
            0,
            Completion::Waiter(tx),
            admission,
        )?;
        let retirement = match rx.recv_timeout(timeout) {
            Ok(retirement) => retirement,
            Err(RecvTimeoutError::Timeout) => {
                debug!(tag = handle.tag(), ?expected, "device command timed out");
                self.clear_transfer(handle.tag, handle.id, Retirement::Timeout);
                rx.recv_timeout(self.config.clear_timeout())
                    .map_err(|_| UfsError::Interrupted)?
            }
            Err(RecvTimeoutError::Disconnected) => return Err(UfsError::Interrupted),
        };
        match retirement {
            Retirement::Completed { ocs, response, .. } => {
                if ocs != Ocs::Success {
                    return Err(UfsError::Ocs(ocs));
                }
                let header = UpiuHeader::decode(&response)?;
                if header.transaction_type != expected as u8 {
                    return Err(UfsError::UnexpectedResponse("device command answer"));
                }
                Ok(response)
            }
            Retirement::Timeout => Err(UfsError::Timeout {
                what: "device command",
                timeout,
            }),
            Retirement::Aborted | Retirement::Requeue => Err(UfsError::Requeued),
        }
    }

    /// Probe link and device liveness with NOP OUT / NOP IN.
    pub(crate) fn nop_out(&self, admission: Admission) -> UfsResult<()> {
        self.nop_out_with_retries(admission, self.config.nop_out_retries)
    }

    pub(crate) fn nop_out_with_retries(&self, admission: Admission, retries: u32) -> UfsResult<()> {
        let attempts = retries.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .exec_dev_cmd(
                    Request::Nop,
                    TransactionType::NopIn,
                    self.config.nop_out_timeout(),
                    admission,
                )
                .and_then(|response| {
                    let header = UpiuHeader::decode(&response)?;
                    if header.response != 0 {
                        return Err(UfsError::UnexpectedResponse("nop in response code"));
                    }
                    Ok(())
                });
            match result {
                Ok(()) => return Ok(()),
                Err(err) if fatal_for_retry(&err) || attempt >= attempts => {
                    warn!(attempt, %err, "nop out failed");
                    return Err(err);
                }
                Err(err) => {
                    debug!(attempt, %err, "nop out failed, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Send a query request, retrying transport failures. Returns the decoded response and
    /// its data segment.
    fn query(
        &self,
        upiu: QueryRequestUpiu,
        data: &[u8],
        admission: Admission,
    ) -> UfsResult<(QueryResponse, Vec<u8>)> {
        let attempts = self.config.query_retries.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .exec_dev_cmd(
                    Request::Query { upiu, data },
                    TransactionType::QueryRsp,
                    self.config.query_timeout(),
                    admission,
                )
                .and_then(|response| {
                    let decoded = QueryResponse::decode(&response)?;
                    if decoded.response != QueryResponseCode::Success {
                        return Err(UfsError::Query {
                            opcode: upiu.opcode,
                            idn: upiu.idn,
                            response: decoded.response,
                        });
                    }
                    let len = (decoded.data_segment_len as usize)
                        .min(response.len().saturating_sub(UPIU_BASE_LEN));
                    Ok((
                        decoded,
                        response[UPIU_BASE_LEN..UPIU_BASE_LEN + len].to_vec(),
                    ))
                });
            match result {
                Ok(answer) => return Ok(answer),
                Err(err @ UfsError::Query { .. }) => return Err(err),
                Err(err) if fatal_for_retry(&err) || attempt >= attempts => {
                    warn!(attempt, opcode = ?upiu.opcode, idn = upiu.idn, %err, "query failed");
                    return Err(err);
                }
                Err(err) => {
                    debug!(attempt, opcode = ?upiu.opcode, %err, "query failed, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Read, set, clear or toggle a flag. Returns the flag value reported by the device.
    pub(crate) fn query_flag(
        &self,
        opcode: QueryOpcode,
        idn: u8,
        admission: Admission,
    ) -> UfsResult<bool> {
        if !matches!(
            opcode,
            QueryOpcode::ReadFlag
                | QueryOpcode::SetFlag
                | QueryOpcode::ClearFlag
                | QueryOpcode::ToggleFlag
        ) {
            return Err(UfsError::InvalidArgument("not a flag opcode"));
        }
        let upiu = QueryRequestUpiu::new(0, opcode, idn, 0, 0);
        let (response, _) = self.query(upiu, &[], admission)?;
        Ok(response.flag())
    }

    pub(crate) fn read_attribute(
        &self,
        idn: u8,
        index: u8,
        selector: u8,
        admission: Admission,
    ) -> UfsResult<u32> {
        let upiu = QueryRequestUpiu::new(0, QueryOpcode::ReadAttr, idn, index, selector);
        let (response, _) = self.query(upiu, &[], admission)?;
        Ok(response.value)
    }

    pub(crate) fn write_attribute(
        &self,
        idn: u8,
        index: u8,
        selector: u8,
        value: u32,
        admission: Admission,
    ) -> UfsResult<()> {
        let upiu = QueryRequestUpiu {
            value,
            ..QueryRequestUpiu::new(0, QueryOpcode::WriteAttr, idn, index, selector)
        };
        self.query(upiu, &[], admission).map(|_| ())
    }

    pub(crate) fn read_descriptor(
        &self,
        idn: u8,
        index: u8,
        selector: u8,
        len: u16,
        admission: Admission,
    ) -> UfsResult<Vec<u8>> {
        let upiu = QueryRequestUpiu {
            length: len,
            ..QueryRequestUpiu::new(0, QueryOpcode::ReadDesc, idn, index, selector)
        };
        let (_, data) = self.query(upiu, &[], admission)?;
        Ok(data)
    }

    pub(crate) fn write_descriptor(
        &self,
        idn: u8,
        index: u8,
        selector: u8,
        data: &[u8],
        admission: Admission,
    ) -> UfsResult<()> {
        let length = u16::try_from(data.len())
            .map_err(|_| UfsError::InvalidArgument("descriptor too long"))?;
        let upiu = QueryRequestUpiu {
            length,
            ..QueryRequestUpiu::new(0, QueryOpcode::WriteDesc, idn, index, selector)
        };
        self.query(upiu, data, admission).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HostState;

    #[test]
    fn admission_failures_are_not_retried() {
        assert!(fatal_for_retry(&UfsError::Busy(HostState::Resetting)));
        assert!(fatal_for_retry(&UfsError::Suspended));
        assert!(!fatal_for_retry(&UfsError::Ocs(Ocs::Aborted)));
        assert!(!fatal_for_retry(&UfsError::Requeued));
    }
}
