//! The connection table: a flat, capacity-bounded array of records addressed by dense indices.

use crate::conn::Flow;
use crate::error::{Result, TcpError};
use crate::hash::{FlowIndex, FlowKey, HashSecret};
use crate::TCP_MAX_CONNS;

/// Records live in `slots`; an index is the only handle to a record.
///
/// Released indices are quarantined until [`ConnTable::reclaim`] runs at the end of the dispatch
/// batch, so an event already queued for the old record can never reach a new one.
#[derive(Debug)]
pub struct ConnTable {
    slots: Vec<Option<Flow>>,
    free: Vec<u32>,
    quarantine: Vec<u32>,
    index: FlowIndex,
    secret: HashSecret,
    capacity: u32,
    live: u32,
}

impl ConnTable {
    pub fn new(capacity: u32, secret: HashSecret) -> Self {
        let capacity = capacity.min(TCP_MAX_CONNS);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            quarantine: Vec::new(),
            index: FlowIndex::with_capacity(capacity as usize),
            secret,
            capacity,
            live: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.capacity
    }

    pub fn allocate(&mut self, flow: Flow) -> Result<u32> {
        if self.is_full() {
            return Err(TcpError::TableExhausted);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None if (self.slots.len() as u32) < self.capacity => {
                self.slots.push(None);
                self.slots.len() as u32 - 1
            }
            // Every index below capacity is either live or quarantined.
            None => return Err(TcpError::TableExhausted),
        };

        if let Some(key) = flow.key() {
            self.index.insert(self.secret.flow_hash(key), index);
        }
        self.slots[index as usize] = Some(flow);
        self.live += 1;
        Ok(index)
    }

    pub fn get(&self, index: u32) -> Result<&Flow> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(TcpError::InvalidIndex(index))
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut Flow> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(TcpError::InvalidIndex(index))
    }

    /// Remove a record. Its index becomes allocatable after the next [`ConnTable::reclaim`].
    pub fn release(&mut self, index: u32) -> Result<Flow> {
        let flow = self
            .slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(TcpError::InvalidIndex(index))?;
        if let Some(key) = flow.key() {
            self.index.remove(self.secret.flow_hash(key), index);
        }
        self.quarantine.push(index);
        self.live -= 1;
        Ok(flow)
    }

    /// Make indices released since the last call allocatable again.
    pub fn reclaim(&mut self) {
        // Most recently released first.
        self.free.extend(self.quarantine.drain(..));
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<u32> {
        let slots = &self.slots;
        self.index.find(self.secret.flow_hash(key), |index| {
            matches!(
                slots.get(index as usize),
                Some(Some(flow)) if flow.key() == Some(key)
            )
        })
    }

    /// Indices of all live records, ascending.
    pub fn indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Flow)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|flow| (index as u32, flow)))
    }
}
