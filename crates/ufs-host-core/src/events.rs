//! Bounded history of recent fault events, kept per kind for diagnostics.

use parking_lot::Mutex;
use std::{collections::VecDeque, time::Instant};

const HISTORY_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PaError,
    DlError,
    NlError,
    TlError,
    DmeError,
    FatalError,
    AutoHibern8Error,
    Desync,
    CommandTimeout,
    LinkStartupFail,
    PowerChangeFail,
    Hibern8EnterFail,
    Hibern8ExitFail,
    TaskAbort,
    DeviceReset,
    HostReset,
    SuspendFail,
    ResumeFail,
}

impl EventKind {
    const ALL: [EventKind; 18] = [
        EventKind::PaError,
        EventKind::DlError,
        EventKind::NlError,
        EventKind::TlError,
        EventKind::DmeError,
        EventKind::FatalError,
        EventKind::AutoHibern8Error,
        EventKind::Desync,
        EventKind::CommandTimeout,
        EventKind::LinkStartupFail,
        EventKind::PowerChangeFail,
        EventKind::Hibern8EnterFail,
        EventKind::Hibern8ExitFail,
        EventKind::TaskAbort,
        EventKind::DeviceReset,
        EventKind::HostReset,
        EventKind::SuspendFail,
        EventKind::ResumeFail,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub at: Instant,
    pub value: u32,
}

#[derive(Default)]
struct Ring {
    recent: VecDeque<EventRecord>,
    total: u64,
}

pub struct EventHistory {
    rings: Mutex<Vec<Ring>>,
}

impl Default for EventHistory {
    fn default() -> Self {
        Self {
            rings: Mutex::new(EventKind::ALL.iter().map(|_| Ring::default()).collect()),
        }
    }
}

impl EventHistory {
    pub fn record(&self, kind: EventKind, value: u32) {
        let mut rings = self.rings.lock();
        let ring = &mut rings[kind.index()];
        if ring.recent.len() == HISTORY_LEN {
            ring.recent.pop_front();
        }
        ring.recent.push_back(EventRecord {
            at: Instant::now(),
            value,
        });
        ring.total += 1;
    }

    /// Most recent events of `kind`, oldest first.
    pub fn recent(&self, kind: EventKind) -> Vec<EventRecord> {
        self.rings.lock()[kind.index()].recent.iter().copied().collect()
    }

    /// Events of `kind` ever recorded, including ones that fell out of the ring.
    pub fn count(&self, kind: EventKind) -> u64 {
        self.rings.lock()[kind.index()].total
    }

    /// Kinds with at least one recorded event and their totals.
    pub fn summary(&self) -> Vec<(EventKind, u64)> {
        let rings = self.rings.lock();
        EventKind::ALL
            .iter()
            .filter_map(|kind| {
                let total = rings[kind.index()].total;
                (total > 0).then_some((*kind, total))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_latest_entries() {
        let history = EventHistory::default();
        for value in 0..12 {
            history.record(EventKind::DlError, value);
        }
        let recent = history.recent(EventKind::DlError);
        assert_eq!(recent.len(), HISTORY_LEN);
        assert_eq!(recent.first().map(|r| r.value), Some(4));
        assert_eq!(recent.last().map(|r| r.value), Some(11));
        assert_eq!(history.count(EventKind::DlError), 12);
        assert_eq!(history.summary(), vec![(EventKind::DlError, 12)]);
    }
}
