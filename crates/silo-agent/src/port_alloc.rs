use std::{collections::BTreeSet, ops::Range};

use crate::state_store::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("all {capacity} instance ports in {start}..{end} are allocated")]
    Exhausted { start: u16, end: u16, capacity: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lowest port in `range` that is not in `used`.
pub fn first_free_port(range: Range<u16>, used: &BTreeSet<u16>) -> Option<u16> {
    range.into_iter().find(|p| !used.contains(p))
}

/// Picks ports from a fixed range by scanning every persisted record.
///
/// The range is a hard cap. Ports of deleted instances become eligible again
/// as soon as their record is gone. An unreadable record fails allocation:
/// its port is unknown and its server may still be bound to it.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self { range }
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    pub async fn used_ports(&self, store: &StateStore) -> Result<BTreeSet<u16>, StoreError> {
        let mut used = BTreeSet::new();
        for entry in store.load_all().await? {
            match entry.record {
                Ok((_, rec)) => {
                    used.insert(rec.port);
                }
                Err(err) => {
                    tracing::error!(record = %entry.name, error = %err, "unreadable record blocks port allocation; delete or repair it");
                    return Err(err);
                }
            }
        }
        Ok(used)
    }

    pub async fn allocate(&self, store: &StateStore) -> Result<u16, AllocError> {
        let used = self.used_ports(store).await?;
        first_free_port(self.range(), &used).ok_or(AllocError::Exhausted {
            start: self.range.start,
            end: self.range.end,
            capacity: self.capacity(),
        })
    }
}
