// Staging pool
//
// Tracks transient host-visible upload buffers and device-local scratch
// buffers so they can be released once the GPU work consuming them has
// provably finished. Each registration is tagged with the frame-timeline
// value of the submission that consumes it; `reclaim` frees lazily as the
// timeline advances, `clear` is the unconditional sweep whose safety the
// caller must guarantee (a fence-wait on the consuming submission).

use crate::backend::arena::{GpuBuffer, MemoryArena, MemoryClass};
use crate::error::Result;
use ash::vk;

struct StagingEntry {
    buffer: GpuBuffer,
    /// Timeline value of the consuming submission; None until sealed.
    retire_value: Option<u64>,
}

/// True when an entry's consuming submission has provably completed
fn is_retired(retire_value: Option<u64>, completed_value: u64) -> bool {
    matches!(retire_value, Some(v) if v <= completed_value)
}

/// Owns every staging and scratch allocation until it is reclaimed.
#[derive(Default)]
pub struct StagingPool {
    entries: Vec<StagingEntry>,
}

impl StagingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a host-visible staging buffer, optionally filled with data.
    ///
    /// The pool keeps ownership; the returned handle stays valid until the
    /// entry is reclaimed or cleared.
    pub fn create_staging_buffer(
        &mut self,
        arena: &MemoryArena,
        size: vk::DeviceSize,
        data: Option<&[u8]>,
    ) -> Result<vk::Buffer> {
        let mut buffer = arena.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryClass::HostVisible,
        )?;

        if let Some(data) = data {
            debug_assert!(data.len() as u64 <= size);
            if let Some(mapped) = buffer.mapped_slice_mut() {
                mapped[..data.len()].copy_from_slice(data);
            } else {
                log::error!("Staging buffer is not host-mapped; upload skipped");
            }
        }

        let handle = buffer.buffer;
        self.entries.push(StagingEntry {
            buffer,
            retire_value: None,
        });
        Ok(handle)
    }

    /// Allocate a device-local scratch buffer for transient GPU-side builds
    /// (acceleration structures and similar). Returns the handle and its
    /// device address.
    pub fn create_scratch_buffer(
        &mut self,
        arena: &MemoryArena,
        size: vk::DeviceSize,
    ) -> Result<(vk::Buffer, vk::DeviceAddress)> {
        let buffer = arena.create_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryClass::DeviceLocal,
        )?;
        let handle = buffer.buffer;
        let address = buffer.device_address;
        self.entries.push(StagingEntry {
            buffer,
            retire_value: None,
        });
        Ok((handle, address))
    }

    /// Tag every untagged registration with the timeline value of the
    /// submission that consumes it. Called once per submission, after the
    /// commands referencing the buffers are recorded.
    pub fn seal(&mut self, retire_value: u64) {
        for entry in &mut self.entries {
            if entry.retire_value.is_none() {
                entry.retire_value = Some(retire_value);
            }
        }
    }

    /// Remove entries whose consuming submission has completed, returning
    /// their buffers for destruction
    pub fn take_retired(&mut self, completed_value: u64) -> Vec<GpuBuffer> {
        let mut retired = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if is_retired(entry.retire_value, completed_value) {
                retired.push(entry.buffer);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        retired
    }

    /// Free everything whose consuming submission has completed
    pub fn reclaim(&mut self, arena: &MemoryArena, completed_value: u64) {
        let retired = self.take_retired(completed_value);
        if !retired.is_empty() {
            log::debug!("Reclaiming {} staging buffers", retired.len());
        }
        for buffer in retired {
            arena.destroy_buffer(buffer);
        }
    }

    /// Remove every registration unconditionally, returning the buffers.
    ///
    /// Callers must guarantee no GPU work reading any of them is still in
    /// flight, typically by having just fence-waited on the transient
    /// submission that consumed them.
    pub fn take_all(&mut self) -> Vec<GpuBuffer> {
        if self.entries.iter().any(|e| e.retire_value.is_none()) {
            log::warn!("Clearing staging buffers that were never sealed to a submission");
        }
        self.entries.drain(..).map(|e| e.buffer).collect()
    }

    /// Destroy every registered staging buffer. See [`Self::take_all`] for
    /// the safety contract.
    pub fn clear(&mut self, arena: &MemoryArena) {
        let count = self.entries.len();
        for buffer in self.take_all() {
            arena.destroy_buffer(buffer);
        }
        if count > 0 {
            log::debug!("Cleared {} staging buffers", count);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(sizes: &[u64]) -> StagingPool {
        let mut pool = StagingPool::new();
        for &size in sizes {
            pool.entries.push(StagingEntry {
                buffer: GpuBuffer::null_for_tests(size),
                retire_value: None,
            });
        }
        pool
    }

    #[test]
    fn unsealed_entries_are_never_retired() {
        assert!(!is_retired(None, u64::MAX));
        let mut pool = pool_with(&[64, 128]);
        assert!(pool.take_retired(u64::MAX).is_empty());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn seal_tags_only_untagged_entries() {
        let mut pool = pool_with(&[64]);
        pool.seal(10);
        pool.entries.push(StagingEntry {
            buffer: GpuBuffer::null_for_tests(32),
            retire_value: None,
        });
        pool.seal(20);
        assert_eq!(pool.entries[0].retire_value, Some(10));
        assert_eq!(pool.entries[1].retire_value, Some(20));
    }

    #[test]
    fn reclaim_frees_only_completed_submissions() {
        let mut pool = pool_with(&[64]);
        pool.seal(10);
        pool.entries.push(StagingEntry {
            buffer: GpuBuffer::null_for_tests(32),
            retire_value: None,
        });
        pool.seal(20);

        // Timeline reached 15: only the first submission's buffer retires
        let retired = pool.take_retired(15);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].size, 64);
        assert_eq!(pool.len(), 1);

        // Timeline reaches 20: the rest retires
        let retired = pool.take_retired(20);
        assert_eq!(retired.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn clear_empties_the_pool_unconditionally() {
        let mut pool = pool_with(&[1, 2, 3]);
        pool.seal(5);
        pool.entries.push(StagingEntry {
            buffer: GpuBuffer::null_for_tests(4),
            retire_value: None,
        });
        let all = pool.take_all();
        assert_eq!(all.len(), 4);
        assert!(pool.is_empty());

        // Registrations after a sweep are fresh entries
        pool.entries.push(StagingEntry {
            buffer: GpuBuffer::null_for_tests(99),
            retire_value: None,
        });
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.entries[0].retire_value, None);
    }
}
