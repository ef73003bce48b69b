//! Bridges `ring_io`'s registered-buffer table into this crate's
//! [`BufferRegistrar`], so a pool can request kernel registration
//! without this crate depending on `ring_io`'s internals any further
//! than that one table.

use ring_core::error::Result;
use ring_io::registered::RegisteredBufferTable;

use crate::pool::BufferRegistrar;

impl BufferRegistrar for RegisteredBufferTable {
    fn register(&self, addr: *mut u8, len: usize) -> Result<usize> {
        RegisteredBufferTable::register(self, addr, len)
    }

    fn update(&self, idx: usize, addr: *mut u8, len: usize) -> Result<()> {
        RegisteredBufferTable::update(self, idx, addr, len)
    }

    fn unregister(&self, idx: usize) {
        let _ = RegisteredBufferTable::unregister(self, idx);
    }
}
