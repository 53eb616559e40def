//! Per-actor ring buffer of recent inputs and the states they produced

use std::collections::VecDeque;

use super::state::{InputFrame, PhysicalState, PredictedRecord};
use crate::util::time::Tick;

/// Ring buffer of the last `capacity` ticks for one actor.
///
/// Records are kept sorted by tick. Each peer owns its own buffer: the
/// controlling client stores predictions, the server stores authoritative
/// results so that late inputs can be re-applied.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    records: VecDeque<PredictedRecord>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create a buffer holding at most `capacity` records (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Store the result of a tick.
    ///
    /// A record for an already buffered tick is overwritten in place; a tick
    /// older than everything retained is ignored. When full, the oldest
    /// record is evicted.
    pub fn record(&mut self, input: InputFrame, state: PhysicalState) {
        let record = PredictedRecord { input, state };
        let tick = state.tick;

        match self.latest_tick() {
            Some(latest) if tick <= latest => match self.position(tick) {
                Ok(idx) => {
                    self.records[idx] = record;
                    return;
                }
                Err(0) => return,
                Err(idx) => self.records.insert(idx, record),
            },
            _ => self.records.push_back(record),
        }

        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Drop every record older than `tick`
    pub fn truncate_before(&mut self, tick: Tick) {
        while self
            .records
            .front()
            .is_some_and(|record| record.tick() < tick)
        {
            self.records.pop_front();
        }
    }

    pub fn get(&self, tick: Tick) -> Option<&PredictedRecord> {
        self.position(tick).ok().map(|idx| &self.records[idx])
    }

    pub fn get_mut(&mut self, tick: Tick) -> Option<&mut PredictedRecord> {
        self.position(tick).ok().map(move |idx| &mut self.records[idx])
    }

    /// Swap the input stored for `tick`, leaving the state untouched.
    /// Returns false if the tick is not buffered.
    pub fn replace_input(&mut self, tick: Tick, input: InputFrame) -> bool {
        match self.get_mut(tick) {
            Some(record) => {
                record.input = input;
                true
            }
            None => false,
        }
    }

    /// Buffered inputs from `tick` (inclusive) onwards, in tick order
    pub fn ticks_from(&self, tick: Tick) -> impl Iterator<Item = &InputFrame> + '_ {
        self.records
            .iter()
            .filter(move |record| record.tick() >= tick)
            .map(|record| &record.input)
    }

    /// Mutable records from `tick` (inclusive) onwards, in tick order
    pub fn records_from_mut(&mut self, tick: Tick) -> impl Iterator<Item = &mut PredictedRecord> + '_ {
        let start = match self.position(tick) {
            Ok(idx) | Err(idx) => idx,
        };
        self.records.range_mut(start..)
    }

    pub fn oldest_tick(&self) -> Option<Tick> {
        self.records.front().map(PredictedRecord::tick)
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.records.back().map(PredictedRecord::tick)
    }

    pub fn latest(&self) -> Option<&PredictedRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn position(&self, tick: Tick) -> Result<usize, usize> {
        self.records.binary_search_by_key(&tick, PredictedRecord::tick)
    }
}
