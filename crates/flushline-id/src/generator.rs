//! Block allocation SPI and the block-slicing identifier generator.

use flushline_core::{Connection, Cx, Error, Outcome, try_outcome};
use std::sync::{Mutex, PoisonError};

/// Reserves contiguous blocks of identifiers from shared storage.
///
/// One call to [`BlockAllocator::next_block`] authorizes the caller to hand
/// out `block_size()` consecutive identifiers starting at the returned value.
pub trait BlockAllocator: Send + Sync {
    /// Number of identifiers in each reserved block.
    fn block_size(&self) -> i64;

    /// Reserve the next block and return its first identifier.
    fn next_block<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;
}

#[derive(Debug, Default)]
struct BlockState {
    next: i64,
    /// Exclusive upper bound of the current block.
    upper: i64,
}

/// Hands out single identifiers from blocks reserved by a [`BlockAllocator`].
///
/// Only the exhausted-block path touches the database. The slicing state is
/// guarded by a mutex that is released before every await.
#[derive(Debug)]
pub struct BlockIdentifierGenerator<A> {
    allocator: A,
    state: Mutex<BlockState>,
}

impl<A: BlockAllocator> BlockIdentifierGenerator<A> {
    /// Wrap an allocator with an empty block.
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            state: Mutex::new(BlockState::default()),
        }
    }

    /// The underlying allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Identifiers left in the current block.
    pub fn remaining(&self) -> i64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.upper - state.next
    }

    fn take(&self) -> Option<i64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.next < state.upper {
            let id = state.next;
            state.next += 1;
            Some(id)
        } else {
            None
        }
    }

    /// Produce the next identifier, reserving a new block when the current
    /// one is used up.
    pub async fn generate<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<i64, Error> {
        if let Some(id) = self.take() {
            tracing::trace!(id, "Identifier from current block");
            return Outcome::Ok(id);
        }

        let start = try_outcome!(self.allocator.next_block(cx, conn).await);
        let size = self.allocator.block_size().max(1);
        let Some(upper) = start.checked_add(size) else {
            return Outcome::Err(Error::IdentifierGeneration(format!(
                "identifier block of {size} starting at {start} overflows"
            )));
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next = start + 1;
        state.upper = upper;
        tracing::debug!(start, size, "Switched to new identifier block");
        Outcome::Ok(start)
    }
}
