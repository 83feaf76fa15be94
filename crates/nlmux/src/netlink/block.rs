//! Transmit gates.

use std::fmt;

use super::connection::{Connection, WeakInner};

pub(crate) struct BlockEntry {
    id: u64,
    pub(crate) name: String,
}

/// Holds back all sending on a connection while alive.
///
/// Several blocks may be held at once; sending resumes, and queued commands
/// are flushed, when the last one is released. Receiving is not affected.
#[must_use = "the connection is unblocked as soon as the block is dropped"]
pub struct Block {
    owner: WeakInner,
    id: u64,
    name: String,
}

impl Block {
    /// Block sending on `conn`. `name` shows up in logs.
    pub fn acquire(conn: &Connection, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut inner = conn.inner.borrow_mut();

        if inner.blocks.is_empty() {
            tracing::info!("tx suspending");
        }
        tracing::info!(name = %name, "tx blocked");

        inner.next_block_id += 1;
        let id = inner.next_block_id;
        inner.blocks.push(BlockEntry {
            id,
            name: name.clone(),
        });

        Self {
            owner: conn.downgrade(),
            id,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the block. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for Block {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };

        let last = {
            let mut inner = owner.borrow_mut();
            let Some(index) = inner.blocks.iter().position(|b| b.id == self.id) else {
                return;
            };
            inner.blocks.remove(index);
            inner.blocks.is_empty()
        };

        tracing::info!(name = %self.name, "tx unblocked");
        if last {
            tracing::info!("tx resuming");
            Connection::from_inner(owner).tx();
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::netlink::fixtures::{GET_FOO, MockKernel, request};

    #[test]
    fn test_last_release_resumes() {
        let kernel = MockKernel::new();
        let conn = kernel.started();

        let blocks: Vec<_> = ["scan", "reconfigure", "flush"]
            .into_iter()
            .map(|name| conn.acquire_block(name))
            .collect();
        assert_eq!(conn.block_names(), vec!["scan", "reconfigure", "flush"]);

        let a = conn.alloc_command();
        a.set_message(Some(request(GET_FOO)));
        assert!(a.is_pending());

        let mut blocks = blocks.into_iter();
        conn.release_block(blocks.next().unwrap());
        blocks.next().unwrap().release();
        assert!(a.is_pending());
        assert_eq!(kernel.sent_count(), 0);
        assert_eq!(conn.block_names(), vec!["flush"]);

        drop(blocks);
        assert!(a.is_in_flight());
        assert_eq!(kernel.sent_count(), 1);
    }

    #[test]
    fn test_block_does_not_stop_receive() {
        let kernel = MockKernel::new();
        let conn = kernel.started();

        let a = conn.alloc_command();
        a.set_message(Some(request(GET_FOO)));
        let _block = conn.acquire_block("hold");

        kernel.ack(kernel.last_sent().seq());
        conn.poll().unwrap();
        assert!(a.is_completed());
        assert!(conn.is_blocked());
    }

    #[test]
    fn test_outlives_connection() {
        let kernel = MockKernel::new();
        let conn = kernel.started();
        let block = conn.acquire_block("orphan");
        drop(conn);
        assert_eq!(block.name(), "orphan");
        drop(block);
    }
}
