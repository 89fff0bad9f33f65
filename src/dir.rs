//! Directory convention helpers.
//!
//! A file whose [`FileFlags::DR`] bit is set interprets its data blocks as
//! arrays of pointer slots holding descriptor indices of child files. Slot
//! values are stored biased by one (`index + 1`) so that descriptor 0 stays
//! representable while a zero slot keeps meaning "no entry": within one
//! block, entries run from slot 0 up to the first zero slot, and listing
//! continues with the next block.
//!
//! The helpers here only maintain that convention; they do not check
//! permissions and do not prevent cycles between directories.

use alloc::vec::Vec;

use crate::err::{CanFail, FsError, FsResult};
use crate::file::FileRef;
use crate::layout::{BlockId, FileFlags, FileId};

impl FileRef<'_> {
    /// Whether the file carries the directory flag.
    pub fn is_dir(&self) -> bool {
        self.attributes().flags.contains(FileFlags::DR)
    }

    /// Lists the descriptor indices stored in the directory's blocks.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a dead descriptor.
    pub fn children(&self) -> FsResult<Vec<FileId>> {
        let mut out = Vec::new();

        for k in 0..self.allocated_block_count() {
            for slot in self.entry_slots(k)? {
                if slot.is_null() {
                    break;
                }
                out.push(FileId::from(slot.index() - 1));
            }
        }

        Ok(out)
    }

    /// Adds a child entry, growing the directory by one (zeroed) block when
    /// every existing block is full.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a dead descriptor; [`FsError::OutOfRange`]
    /// for a child index past the descriptor table; [`FsError::OutOfSpace`]
    /// when the store cannot hold a needed extra block.
    pub fn add_child(&mut self, child: FileId) -> CanFail<FsError> {
        self.check_child(child)?;
        let block_count = self.allocated_block_count();

        for k in 0..block_count {
            if let Some(free) = self
                .entry_slots(k)?
                .iter()
                .position(|slot| slot.is_null())
            {
                self.set_entry_slot(k, free as u64, Self::entry_value(child))?;
                return Ok(());
            }
        }

        // every block is full: append one and use its first slot
        let block_size = self.fs().geometry().block_size();
        self.resize((block_count + 1) * block_size)?;
        self.block_mut(block_count)?.fill(0);
        self.set_entry_slot(block_count, 0, Self::entry_value(child))
    }

    /// Removes a child entry, compacting its block by moving the last entry
    /// of that block into the vacated slot.
    ///
    /// # Errors
    ///
    /// [`FsError::OutOfRange`] for a child index past the descriptor table;
    /// [`FsError::NotFound`] when the descriptor is dead or the entry is
    /// absent.
    pub fn remove_child(&mut self, child: FileId) -> CanFail<FsError> {
        self.check_child(child)?;

        for k in 0..self.allocated_block_count() {
            let slots = self.entry_slots(k)?;

            let end = slots
                .iter()
                .position(|slot| slot.is_null())
                .unwrap_or(slots.len());

            let Some(hit) = slots[..end]
                .iter()
                .position(|slot| *slot == Self::entry_value(child))
            else {
                continue;
            };

            let last = slots[end - 1];
            self.set_entry_slot(k, hit as u64, last)?;
            self.set_entry_slot(k, end as u64 - 1, BlockId::NULL)?;
            return Ok(());
        }

        Err(FsError::NotFound)
    }

    /// Rejects child ids outside the descriptor table; the geometry bounds
    /// the table well below `u64::MAX`, so an in-range id survives the
    /// slot-encoding bias.
    fn check_child(&self, child: FileId) -> CanFail<FsError> {
        if child.index() >= self.fs().geometry().descriptor_count() {
            return Err(FsError::OutOfRange);
        }

        Ok(())
    }

    /// Slot encoding of a child id: biased by one so 0 stays the
    /// terminator.
    fn entry_value(child: FileId) -> BlockId {
        BlockId::from(child.index() + 1)
    }

    fn entry_slots(&self, k: u64) -> FsResult<Vec<BlockId>> {
        Ok(bytemuck::cast_slice(self.block(k)?).to_vec())
    }

    fn set_entry_slot(&mut self, k: u64, slot: u64, value: BlockId) -> CanFail<FsError> {
        let slots: &mut [BlockId] = bytemuck::cast_slice_mut(self.block_mut(k)?);
        *slots.get_mut(slot as usize).ok_or(FsError::OutOfRange)? = value;
        Ok(())
    }
}
