// Frame pacing primitives
//
// A single timeline semaphore replaces per-frame fences: each frame slot
// records the counter value that must be reached before its command pool
// and buffers may be reused. The counter is monotonically non-decreasing;
// a slot's target advances by N (frames in flight) on every submission, so
// at most N frames of unconsumed work exist at any time.

use crate::backend::VulkanDevice;
use crate::error::{Error, Result};
use ash::vk;
use std::sync::Arc;

/// Monotonic CPU/GPU synchronization counter.
///
/// Created once at init with value `N-1` so the first N frames pass their
/// wait immediately. Never recreated, including across swapchain rebuilds.
pub struct FrameTimeline {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
    frames_in_flight: u64,
}

impl FrameTimeline {
    pub fn new(device: Arc<VulkanDevice>, frames_in_flight: usize) -> Result<Self> {
        let frames_in_flight = frames_in_flight as u64;
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(frames_in_flight - 1);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&info, None) }?;

        Ok(Self {
            device,
            semaphore,
            frames_in_flight,
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn frames_in_flight(&self) -> u64 {
        self.frames_in_flight
    }

    /// Block until the counter reaches `value`.
    ///
    /// The timeout is finite so a lost device cannot hang the process; in
    /// correct operation this wait always succeeds.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(Error::DeviceHang { timeout_ns }),
            Err(e) => Err(e.into()),
        }
    }

    /// Counter value the GPU has completed so far
    pub fn completed_value(&self) -> Result<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }?;
        Ok(value)
    }
}

impl Drop for FrameTimeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Per-frame recording context: command pool + buffer + the timeline value
/// gating its reuse. Slot `k` starts at `required_value = k`, below the
/// timeline's initial `N-1`, so the first pass over the slots never waits.
pub struct FrameSlot {
    pub pool: vk::CommandPool,
    pub cmd: vk::CommandBuffer,
    pub required_value: u64,
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>, slot_index: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            pool,
            cmd,
            required_value: slot_index as u64,
        })
    }

    /// Advance the reuse gate by N and return the timeline value the next
    /// submission must signal
    pub fn advance(&mut self, frames_in_flight: u64) -> u64 {
        self.required_value += frames_in_flight;
        self.required_value
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: usize) -> FrameSlot {
        FrameSlot {
            pool: vk::CommandPool::null(),
            cmd: vk::CommandBuffer::null(),
            required_value: index as u64,
        }
    }

    #[test]
    fn first_pass_over_slots_never_waits() {
        for n in [2u64, 3] {
            let initial_counter = n - 1;
            for k in 0..n as usize {
                assert!(slot(k).required_value <= initial_counter);
            }
        }
    }

    #[test]
    fn frame_f_waits_for_f_and_signals_f_plus_n() {
        for n in [2u64, 3] {
            let mut slots: Vec<FrameSlot> = (0..n as usize).map(slot).collect();
            for frame in 0..10u64 {
                let k = (frame % n) as usize;
                // begin_frame waits on the value frame `f - N` signaled,
                // which is exactly `f` (trivially satisfied for f < N)
                assert_eq!(slots[k].required_value, frame);
                let signal = slots[k].advance(n);
                assert_eq!(signal, frame + n);
            }
        }
    }

    #[test]
    fn at_most_n_frames_outstanding() {
        // Simulate the GPU lagging maximally: the counter only advances when
        // the CPU is forced to wait for it.
        for n in [2u64, 3] {
            let mut slots: Vec<FrameSlot> = (0..n as usize).map(slot).collect();
            let mut gpu_counter = n - 1;
            let mut outstanding = 0u64;

            for frame in 0..32u64 {
                let k = (frame % n) as usize;
                // begin_frame: the CPU blocks until the counter reaches the
                // slot's gate; model the GPU completing exactly that much.
                if gpu_counter < slots[k].required_value {
                    let retired = slots[k].required_value - gpu_counter;
                    gpu_counter = slots[k].required_value;
                    outstanding -= retired;
                }
                // end_frame
                slots[k].advance(n);
                outstanding += 1;
                assert!(outstanding <= n, "frame {}: {} > {} in flight", frame, outstanding, n);
            }
        }
    }

    #[test]
    fn no_false_waiting_after_signal() {
        // Once the GPU signaled slot k's gate, the next begin_frame on that
        // slot must pass immediately: its wait target equals the value the
        // slot's previous submission signaled, nothing higher.
        let n = 2u64;
        let mut s = slot(0);
        let signaled = s.advance(n); // frame 0 submits, will signal 2
        assert_eq!(s.required_value, signaled);

        // frame 2 reuses slot 0: its wait target is the gate as it stands
        let wait_target = s.required_value;
        let gpu_counter = signaled; // GPU has signaled frame 0
        assert!(gpu_counter >= wait_target);
    }
}
