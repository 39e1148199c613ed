//! # Control Block Table
//!
//! Registry for all fibers of one runtime. Handles are indices into a
//! growable arena with a fixed capacity; slots are never reused, so a
//! handle stays valid for the lifetime of the runtime.

use super::{ControlBlock, FiberState};
use crate::{ExecError, ExecResult, FiberId};

/// Control block table
#[derive(Debug)]
pub struct ControlBlockTable {
    /// All fibers, indexed by ID
    blocks: Vec<ControlBlock>,
    /// Maximum number of fibers
    capacity: usize,
}

impl ControlBlockTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            capacity,
        }
    }

    /// Register a new fiber
    ///
    /// `build` receives the ID the fiber will get. The table is left
    /// unchanged if it is full or if `build` fails.
    pub fn insert<F>(&mut self, build: F) -> ExecResult<FiberId>
    where
        F: FnOnce(FiberId) -> ExecResult<ControlBlock>,
    {
        if self.is_full() {
            return Err(ExecError::ThreadCapacity);
        }

        let id = FiberId::from_index(self.blocks.len());
        let block = build(id)?;
        debug_assert_eq!(block.id(), id);
        self.blocks.push(block);
        Ok(id)
    }

    /// Get a fiber by ID
    pub fn get(&self, id: FiberId) -> Option<&ControlBlock> {
        self.blocks.get(id.index())
    }

    /// Get a fiber by ID (mutable)
    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut ControlBlock> {
        self.blocks.get_mut(id.index())
    }

    /// Number of fibers ever created
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if no fiber was ever created
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Maximum number of fibers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if another fiber can be created
    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    /// Count fibers in a state
    pub fn count_by_state(&self, state: FiberState) -> usize {
        self.blocks.iter().filter(|cb| cb.state() == state).count()
    }

    /// Iterate over all fibers in creation order
    pub fn iter(&self) -> impl Iterator<Item = &ControlBlock> {
        self.blocks.iter()
    }

    /// Release the stacks of exited fibers
    ///
    /// `executing` is the fiber whose stack is in use by the caller; it is
    /// skipped even if it already reached `Exit`. Returns the number of
    /// stacks released.
    pub fn reap_exited(&mut self, executing: Option<FiberId>) -> usize {
        let mut released = 0;
        for cb in self.blocks.iter_mut() {
            if Some(cb.id()) == executing || !cb.state().is_terminated() {
                continue;
            }
            if cb.release_stack() {
                log::debug!("{}: stack released", cb.id());
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::control_block::tests::block;

    fn fill(table: &mut ControlBlockTable, n: usize) -> Vec<FiberId> {
        (0..n)
            .map(|i| table.insert(|id| Ok(block(id.index(), &format!("f{}", i)))).unwrap())
            .collect()
    }

    fn finish(table: &mut ControlBlockTable, id: FiberId) {
        let cb = table.get_mut(id).unwrap();
        cb.set_state(FiberState::Running);
        cb.set_state(FiberState::Exit);
    }

    #[test]
    fn test_unique_ids_up_to_capacity() {
        let mut table = ControlBlockTable::new(8);
        let ids = fill(&mut table, 8);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
        assert!(table.is_full());

        let result = table.insert(|id| Ok(block(id.index(), "extra")));
        assert_eq!(result, Err(ExecError::ThreadCapacity));
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn test_failed_build_leaves_table_unchanged() {
        let mut table = ControlBlockTable::new(4);
        fill(&mut table, 1);
        let result = table.insert(|_| Err(ExecError::InvalidArgument));
        assert_eq!(result, Err(ExecError::InvalidArgument));
        assert_eq!(table.len(), 1);
        assert!(table.get(FiberId::from_index(1)).is_none());
    }

    #[test]
    fn test_count_by_state() {
        let mut table = ControlBlockTable::new(4);
        let ids = fill(&mut table, 3);
        finish(&mut table, ids[1]);
        assert_eq!(table.count_by_state(FiberState::Runnable), 2);
        assert_eq!(table.count_by_state(FiberState::Exit), 1);
    }

    #[test]
    fn test_reap_skips_executing_and_live_fibers() {
        let mut table = ControlBlockTable::new(4);
        let ids = fill(&mut table, 3);
        finish(&mut table, ids[0]);
        finish(&mut table, ids[2]);

        assert_eq!(table.reap_exited(Some(ids[2])), 1);
        assert!(!table.get(ids[0]).unwrap().has_stack());
        assert!(table.get(ids[1]).unwrap().has_stack());
        assert!(table.get(ids[2]).unwrap().has_stack());

        assert_eq!(table.reap_exited(None), 1);
        assert!(!table.get(ids[2]).unwrap().has_stack());
        assert_eq!(table.reap_exited(None), 0);
    }
}
