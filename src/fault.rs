use crate::protection::FaultKind;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_TRIP_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRecord {
    pub id: u32,
    pub fault: FaultKind,
    pub tripped_at_ms: u64,
    pub cleared_at_ms: Option<u64>,
}

/// Trip history seen from the communications side, built from snapshot
/// transitions.
#[derive(Debug)]
pub struct FaultLog {
    history: Vec<TripRecord, MAX_TRIP_HISTORY>,
    next_id: u32,
    last_latched: u32,
    last_trip_count: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_id: 1,
            last_latched: 0,
            last_trip_count: 0,
        }
    }

    /// Fold in the latest latch word. Returns the fault recorded, if a new
    /// trip happened since the previous observation.
    pub fn observe(
        &mut self,
        latched: u32,
        trip_count: u32,
        last_trip: Option<FaultKind>,
        uptime_ms: u64,
    ) -> Option<FaultKind> {
        let cleared = self.last_latched & !latched;
        if cleared != 0 {
            for record in self.history.iter_mut() {
                if record.cleared_at_ms.is_none() && record.fault.bit() & cleared != 0 {
                    record.cleared_at_ms = Some(uptime_ms);
                }
            }
        }
        self.last_latched = latched;

        if trip_count == self.last_trip_count {
            return None;
        }
        self.last_trip_count = trip_count;
        let fault = last_trip?;
        self.record(fault, uptime_ms);
        Some(fault)
    }

    fn record(&mut self, fault: FaultKind, uptime_ms: u64) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(TripRecord {
            id,
            fault,
            tripped_at_ms: uptime_ms,
            cleared_at_ms: None,
        });
        id
    }

    pub fn active(&self) -> impl Iterator<Item = &TripRecord> {
        self.history.iter().filter(|r| r.cleared_at_ms.is_none())
    }

    pub fn history(&self) -> &[TripRecord] {
        &self.history
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}
