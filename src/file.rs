//! File handles.
//!
//! A [`FileRef`] pairs a mutable store borrow with a descriptor index and
//! exposes every per-file operation: lifecycle (create, delete, resize),
//! content access through the indirection trees, the opaque attribute and
//! timestamp fields, and the name chain.
//!
//! The handle performs no descriptor-index allocation: callers pick an index
//! and `create` reports whether it was free. A "create at the next free
//! index" policy belongs to an outer layer.

use alloc::vec::Vec;

use bytemuck::{from_bytes, from_bytes_mut};

use crate::err::{CanFail, FsError, FsResult};
use crate::layout::{BlockId, Descriptor, FileFlags, FileId, SecurityAttributes};
use crate::store::MemFs;

/// Handle over one descriptor of a store.
pub struct FileRef<'fs> {
    fs: &'fs mut MemFs,
    id: FileId,
}

impl<'fs> FileRef<'fs> {
    /// Builds a handle for a descriptor index already validated by
    /// [`MemFs::file_at`].
    pub(crate) fn new(fs: &'fs mut MemFs, id: FileId) -> Self {
        Self { fs, id }
    }

    /// The descriptor index this handle points at.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// The store this handle operates on.
    pub(crate) fn fs(&self) -> &MemFs {
        self.fs
    }

    fn desc(&self) -> &Descriptor {
        self.fs
            .descriptor(self.id)
            .expect("handle holds a validated descriptor index")
    }

    fn desc_mut(&mut self) -> &mut Descriptor {
        self.fs
            .descriptor_mut(self.id)
            .expect("handle holds a validated descriptor index")
    }

    fn ensure_live(&self) -> CanFail<FsError> {
        if !self.desc().exists() {
            return Err(FsError::NotFound);
        }

        Ok(())
    }

    /// Whether the descriptor is live.
    pub fn exists(&self) -> bool {
        self.desc().exists()
    }

    /// Marks the descriptor live with empty attributes.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`] on a live descriptor, whose fields are
    /// left untouched.
    pub fn create(&mut self) -> CanFail<FsError> {
        self.create_with(SecurityAttributes::default())
    }

    /// Marks the descriptor live, carrying the given attributes.
    ///
    /// The size, timestamp, name pointer and indirection roots are zeroed;
    /// the EX bit is forced on regardless of `attributes`.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`] on a live descriptor.
    pub fn create_with(&mut self, attributes: SecurityAttributes) -> CanFail<FsError> {
        if self.exists() {
            return Err(FsError::AlreadyExists);
        }

        let desc = self.desc_mut();
        *desc = Descriptor::default();
        desc.attributes = attributes;
        desc.attributes.flags = attributes.flags | FileFlags::EX;
        Ok(())
    }

    /// Deletes the file: frees its name chain and every reachable data and
    /// pointer block, zeroes the descriptor's header and clears the EX bit.
    ///
    /// Deleting a descriptor that is not live is a no-op.
    pub fn delete(&mut self) -> CanFail<FsError> {
        if !self.exists() {
            return Ok(());
        }

        let size = self.size();
        self.free_name_chain()?;

        let block_size = self.fs.geometry().block_size();
        for _ in 0..self.desc().block_count(block_size) {
            self.fs.free_tail_block(self.id)?;
        }

        let desc = self.desc_mut();
        desc.header = Default::default();
        desc.attributes.flags = desc.attributes.flags & !FileFlags::EX;

        log::debug!("memfs: deleted file {} ({size} bytes)", self.id);
        Ok(())
    }

    /// Grows or shrinks the file to `size` bytes.
    ///
    /// Growth appends blocks at increasing logical indices, allocating
    /// interior pointer blocks lazily; shrinking frees from the top index
    /// down and eagerly releases pointer blocks that become empty. The
    /// exact byte size is committed once the block set matches the target,
    /// so the operation is idempotent with respect to the final size.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a dead descriptor, [`FsError::OutOfRange`]
    /// past the indirection capacity, [`FsError::OutOfSpace`] when the
    /// store runs dry. On both failures the blocks appended before the
    /// limit stay committed and the size reflects them.
    pub fn resize(&mut self, size: u64) -> CanFail<FsError> {
        self.fs.resize_file(self.id, size)
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.desc().header.size
    }

    /// Number of data blocks backing the file: `⌈size / block_size⌉`.
    pub fn allocated_block_count(&self) -> u64 {
        self.desc().block_count(self.fs.geometry().block_size())
    }

    /// The descriptor's security attributes.
    pub fn attributes(&self) -> SecurityAttributes {
        self.desc().attributes
    }

    /// Replaces the opaque attribute fields of a live file. The EX bit is
    /// preserved whatever `attributes` carries.
    pub fn set_attributes(&mut self, attributes: SecurityAttributes) -> CanFail<FsError> {
        self.ensure_live()?;

        let desc = self.desc_mut();
        let ex = desc.attributes.flags & FileFlags::EX;
        desc.attributes = attributes;
        desc.attributes.flags = (attributes.flags & !FileFlags::EX) | ex;
        Ok(())
    }

    /// The opaque creation timestamp.
    pub fn creation_time(&self) -> u64 {
        self.desc().header.creation_time
    }

    /// Stamps the opaque creation timestamp. The core carries no clock;
    /// callers provide the value.
    pub fn set_creation_time(&mut self, time: u64) -> CanFail<FsError> {
        self.ensure_live()?;
        self.desc_mut().header.creation_time = time;
        Ok(())
    }

    fn data_block(&self, k: u64) -> FsResult<BlockId> {
        self.ensure_live()?;

        if k >= self.allocated_block_count() {
            return Err(FsError::OutOfRange);
        }

        let block = self.fs.locate_block(self.desc(), k)?;
        debug_assert!(!block.is_null());
        Ok(block)
    }

    /// Borrows the `k`-th data block of the file.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a dead descriptor, [`FsError::OutOfRange`]
    /// for `k` past the file's block count.
    pub fn block(&self, k: u64) -> FsResult<&[u8]> {
        let block = self.data_block(k)?;
        self.fs.block(block)
    }

    /// Mutably borrows the `k`-th data block of the file.
    ///
    /// # Errors
    ///
    /// See [`FileRef::block`].
    pub fn block_mut(&mut self, k: u64) -> FsResult<&mut [u8]> {
        let block = self.data_block(k)?;
        self.fs.block_mut(block)
    }

    /// Copies file content starting at byte `offset` into `buf`.
    ///
    /// Reads are clamped to the file size; an offset at or past the end
    /// reads zero bytes. Returns the number of bytes copied.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.ensure_live()?;

        let size = self.size();
        if offset >= size {
            return Ok(0);
        }

        let block_size = self.fs.geometry().block_size();
        let total = (buf.len() as u64).min(size - offset);

        let mut copied = 0u64;
        while copied < total {
            let pos = offset + copied;
            let inner = (pos % block_size) as usize;
            let chunk = (total - copied).min(block_size - inner as u64) as usize;

            let block = self.block(pos / block_size)?;
            buf[copied as usize..copied as usize + chunk]
                .copy_from_slice(&block[inner..inner + chunk]);

            copied += chunk as u64;
        }

        Ok(copied as usize)
    }

    /// Copies `buf` into the file content starting at byte `offset`.
    ///
    /// Writes never change the block set: the range is clamped to
    /// `[offset, size)` and the number of bytes actually written is
    /// returned. Extending a file is done with [`FileRef::resize`].
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> FsResult<usize> {
        self.ensure_live()?;

        let size = self.size();
        if offset >= size {
            return Ok(0);
        }

        let block_size = self.fs.geometry().block_size();
        let total = (buf.len() as u64).min(size - offset);

        let mut copied = 0u64;
        while copied < total {
            let pos = offset + copied;
            let inner = (pos % block_size) as usize;
            let chunk = (total - copied).min(block_size - inner as u64) as usize;

            let block = self.block_mut(pos / block_size)?;
            block[inner..inner + chunk]
                .copy_from_slice(&buf[copied as usize..copied as usize + chunk]);

            copied += chunk as u64;
        }

        Ok(copied as usize)
    }

    fn name_next(&self, block: BlockId) -> FsResult<BlockId> {
        Ok(*from_bytes(&self.fs.block(block)?[..8]))
    }

    /// Frees the whole name chain and clears the descriptor's name pointer.
    fn free_name_chain(&mut self) -> CanFail<FsError> {
        let mut cur = self.desc().header.name_ptr;
        self.desc_mut().header.name_ptr = BlockId::NULL;

        while !cur.is_null() {
            let next = self.name_next(cur)?;
            self.fs.free_block(cur)?;
            cur = next;
        }

        Ok(())
    }

    /// Renames the file.
    ///
    /// The previous name chain is freed first, then `name` is written
    /// across freshly allocated name blocks, each holding a next-pointer
    /// and `block_size - 8` name bytes, NUL-padded in the last block. Bytes
    /// from the first NUL of `name` onwards are ignored.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a dead descriptor. [`FsError::BadGeometry`]
    /// on a store whose blocks are exactly one pointer wide, since its name
    /// blocks have no room for name bytes. [`FsError::OutOfSpace`] when the
    /// store cannot hold the chain; the partial chain is freed again and
    /// the file is left unnamed.
    pub fn set_name(&mut self, name: &[u8]) -> CanFail<FsError> {
        self.ensure_live()?;

        let terminated = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        let name = &name[..terminated];

        let block_size = self.fs.geometry().block_size() as usize;
        if !name.is_empty() && block_size <= 8 {
            return Err(FsError::BadGeometry);
        }

        self.free_name_chain()?;
        if name.is_empty() {
            return Ok(());
        }

        let mut first = BlockId::NULL;
        let mut prev = BlockId::NULL;

        for chunk in name.chunks(block_size - 8) {
            let block = match self.fs.allocate_block(0) {
                Ok(block) => block,
                Err(e) => {
                    // drop the partial chain; the links written so far make
                    // it walkable from `first`
                    self.desc_mut().header.name_ptr = first;
                    self.free_name_chain()?;
                    return Err(e);
                }
            };

            let bytes = self.fs.block_mut(block)?;
            bytes[..8].fill(0);
            bytes[8..8 + chunk.len()].copy_from_slice(chunk);
            bytes[8 + chunk.len()..].fill(0);

            if prev.is_null() {
                first = block;
            } else {
                let prev_bytes = self.fs.block_mut(prev)?;
                *from_bytes_mut(&mut prev_bytes[..8]) = block;
            }
            prev = block;
        }

        self.desc_mut().header.name_ptr = first;
        Ok(())
    }

    /// Reads the file name by walking the name chain. An unnamed file
    /// yields an empty buffer.
    pub fn name(&self) -> FsResult<Vec<u8>> {
        self.ensure_live()?;

        let block_size = self.fs.geometry().block_size() as usize;
        let mut out = Vec::new();
        let mut cur = self.desc().header.name_ptr;

        while !cur.is_null() {
            let bytes = &self.fs.block(cur)?[8..block_size];
            match bytes.iter().position(|b| *b == 0) {
                Some(end) => {
                    out.extend_from_slice(&bytes[..end]);
                    break;
                }
                None => out.extend_from_slice(bytes),
            }

            cur = self.name_next(cur)?;
        }

        Ok(out)
    }
}
