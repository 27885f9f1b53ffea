use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Matches an outbound call to its eventual result. Only meaningful to the agent that
/// allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u32);

impl CorrelationId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn from_wire(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().filter(|raw| *raw != 0).map(Self)
    }

    pub fn to_wire(self) -> i64 {
        i64::from(self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct PendingCall<O, C> {
    pub id: CorrelationId,
    pub owner: O,
    pub completion: C,
}

impl<O: fmt::Debug, C> fmt::Debug for PendingCall<O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Outstanding calls originated by one agent, keyed by correlation id.
///
/// Every entry leaves the table exactly once: through [`CorrelationTable::take`] when its
/// result arrives, or through one of the sweeps.
pub struct CorrelationTable<O, C> {
    next_id: u32,
    pending: HashMap<CorrelationId, PendingCall<O, C>>,
}

impl<O, C> Default for CorrelationTable<O, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, C> CorrelationTable<O, C> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(next_id: u32) -> Self {
        Self {
            next_id: next_id.max(1),
            pending: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id = id.wrapping_add(1).max(1);
        CorrelationId(id)
    }

    /// Record a new pending call under the next id.
    ///
    /// If the counter has wrapped onto an id that is still pending, the call is refused and
    /// handed back together with the colliding id; the existing entry is left untouched.
    pub fn insert(&mut self, owner: O, completion: C) -> Result<CorrelationId, (CorrelationId, C)> {
        let id = self.next_id();
        if self.pending.contains_key(&id) {
            return Err((id, completion));
        }
        self.pending.insert(
            id,
            PendingCall {
                id,
                owner,
                completion,
            },
        );
        Ok(id)
    }

    pub fn take(&mut self, id: CorrelationId) -> Option<PendingCall<O, C>> {
        self.pending.remove(&id)
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Remove every pending call whose owner matches `predicate`.
    pub fn sweep(&mut self, mut predicate: impl FnMut(&O) -> bool) -> Vec<PendingCall<O, C>> {
        let doomed: Vec<CorrelationId> = self
            .pending
            .values()
            .filter(|call| predicate(&call.owner))
            .map(|call| call.id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<PendingCall<O, C>> {
        self.pending.drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
