//! Record registry: one ordered map plus per-state FIFO order

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::record::{RecordState, TargetRecord};
use crate::target::{ListSelector, SeqId};

const STATES: [RecordState; 3] = [
    RecordState::Importing,
    RecordState::Producing,
    RecordState::Consuming,
];

fn selects(selector: ListSelector, state: RecordState) -> bool {
    match selector {
        ListSelector::Producer => state == RecordState::Producing,
        ListSelector::Consumer => state == RecordState::Consuming,
        ListSelector::ProducerAndConsumer => {
            matches!(state, RecordState::Producing | RecordState::Consuming)
        }
        ListSelector::Import => state == RecordState::Importing,
    }
}

/// All records of one manager.
///
/// Producer order is ascending seqId, consumer order is migration order and
/// import order is registration order.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    records: BTreeMap<SeqId, TargetRecord>,
    order: [VecDeque<SeqId>; 3],
    next_record_id: u64,
    /// Setups that left the lock to populate their record
    in_flight: BTreeSet<SeqId>,
    /// Highest seqId ever admitted by a successful setup
    last_admitted: Option<SeqId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_record_id(&mut self) -> u64 {
        self.next_record_id += 1;
        self.next_record_id
    }

    pub fn get(&self, seq_id: SeqId, selector: ListSelector) -> Option<&TargetRecord> {
        self.records
            .get(&seq_id)
            .filter(|r| selects(selector, r.state))
    }

    pub fn get_mut(&mut self, seq_id: SeqId, selector: ListSelector) -> Option<&mut TargetRecord> {
        self.records
            .get_mut(&seq_id)
            .filter(|r| selects(selector, r.state))
    }

    pub fn insert(&mut self, record: TargetRecord) {
        let seq_id = record.seq_id;
        let state = record.state;
        if let Some(old) = self.records.insert(seq_id, record) {
            self.unlink(seq_id, old.state);
        }
        self.link(seq_id, state);
    }

    /// Move a record to another staging area, keeping the others' order
    pub fn transition(&mut self, seq_id: SeqId, to: RecordState) -> bool {
        let from = match self.records.get_mut(&seq_id) {
            Some(record) => {
                let from = record.state;
                record.state = to;
                from
            }
            None => return false,
        };
        self.unlink(seq_id, from);
        self.link(seq_id, to);
        true
    }

    pub fn remove(&mut self, seq_id: SeqId) -> Option<TargetRecord> {
        let record = self.records.remove(&seq_id)?;
        self.unlink(seq_id, record.state);
        Some(record)
    }

    /// Remove every record, consumer records first
    pub fn drain(&mut self) -> Vec<TargetRecord> {
        let mut out = Vec::with_capacity(self.records.len());
        for state in STATES.iter().rev() {
            let ids: Vec<SeqId> = self.order[state.index()].iter().copied().collect();
            for seq_id in ids {
                if let Some(record) = self.remove(seq_id) {
                    out.push(record);
                }
            }
        }
        out
    }

    pub fn count(&self, state: RecordState) -> usize {
        self.order[state.index()].len()
    }

    /// Producer plus consumer records
    pub fn live_count(&self) -> usize {
        self.count(RecordState::Producing) + self.count(RecordState::Consuming)
    }

    pub fn head(&self, state: RecordState) -> Option<SeqId> {
        self.order[state.index()].front().copied()
    }

    pub fn tail(&self, state: RecordState) -> Option<SeqId> {
        self.order[state.index()].back().copied()
    }

    pub fn ids(&self, selector: ListSelector) -> Vec<SeqId> {
        match selector {
            ListSelector::ProducerAndConsumer => self
                .records
                .values()
                .filter(|r| selects(selector, r.state))
                .map(|r| r.seq_id)
                .collect(),
            ListSelector::Producer => self.order_of(RecordState::Producing),
            ListSelector::Consumer => self.order_of(RecordState::Consuming),
            ListSelector::Import => self.order_of(RecordState::Importing),
        }
    }

    /// Whether `count` live records follow each other from `start`
    pub fn has_run(&self, start: SeqId, count: u32) -> bool {
        (0..count).all(|i| {
            start
                .checked_add(i)
                .is_some_and(|seq_id| self.get(seq_id, ListSelector::ProducerAndConsumer).is_some())
        })
    }

    /// Start of the first run of `count` contiguous live records after `start`
    pub fn next_run_after(&self, start: SeqId, count: u32) -> Option<SeqId> {
        let from = start.checked_add(1)?;
        let mut anchor: Option<SeqId> = None;
        let mut prev: Option<SeqId> = None;
        for record in self
            .records
            .range(from..)
            .map(|(_, r)| r)
            .filter(|r| selects(ListSelector::ProducerAndConsumer, r.state))
        {
            let seq_id = record.seq_id;
            if prev.map_or(true, |p| seq_id != p + 1) {
                anchor = Some(seq_id);
            }
            prev = Some(seq_id);
            if let Some(a) = anchor {
                if seq_id - a + 1 == count {
                    return Some(a);
                }
            }
        }
        None
    }

    /// Highest live (producer or consumer) seqId
    pub fn max_live_seq(&self) -> Option<SeqId> {
        self.records
            .values()
            .rev()
            .find(|r| selects(ListSelector::ProducerAndConsumer, r.state))
            .map(|r| r.seq_id)
    }

    /// Oldest consumer record nobody references
    pub fn first_recyclable(&self) -> Option<SeqId> {
        self.order[RecordState::Consuming.index()]
            .iter()
            .copied()
            .find(|seq_id| self.records.get(seq_id).is_some_and(|r| r.ref_count == 0))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn begin_setup(&mut self, seq_id: SeqId) {
        self.in_flight.insert(seq_id);
    }

    pub fn end_setup(&mut self, seq_id: SeqId, admitted: bool) {
        self.in_flight.remove(&seq_id);
        if admitted && self.last_admitted.map_or(true, |last| seq_id > last) {
            self.last_admitted = Some(seq_id);
        }
    }

    /// Highest seqId a new setup must exceed
    pub fn setup_floor(&self) -> Option<SeqId> {
        let pending = self.in_flight.iter().next_back().copied();
        match (self.last_admitted, pending) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn order_of(&self, state: RecordState) -> Vec<SeqId> {
        self.order[state.index()].iter().copied().collect()
    }

    fn link(&mut self, seq_id: SeqId, state: RecordState) {
        let list = &mut self.order[state.index()];
        if state == RecordState::Producing {
            let at = list.partition_point(|&s| s < seq_id);
            list.insert(at, seq_id);
        } else {
            list.push_back(seq_id);
        }
    }

    fn unlink(&mut self, seq_id: SeqId, state: RecordState) {
        let list = &mut self.order[state.index()];
        if let Some(at) = list.iter().position(|&s| s == seq_id) {
            list.remove(at);
        }
    }
}
