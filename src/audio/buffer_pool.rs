// BufferPool - fixed ring of pre-allocated PCM buffers with atomic state tags
//
// The pool owns every sample the engine will ever play for a session. Buffers are
// indexed 0..N and reused in place; nothing is allocated after `allocate` returns.
//
// Ownership is enforced by protocol, not by a lock. Each buffer carries a state tag:
// - Stale:   free; may be claimed by the cycler or the seek controller
// - Filling: the claiming context is writing samples
// - Filled:  published, waiting for the render callback
// - Reading: the render callback is consuming it
//
// Buffer flow:
// 1. Cycler claims a Stale buffer (Stale -> Filling) and decodes into it
// 2. Cycler publishes it (Filling -> Filled, release)
// 3. Render callback claims it (Filled -> Reading, acquire) and copies samples out
// 4. Render callback vacates it (Reading -> Stale) and wakes the cycler
//
// Samples are stored as f32 bit patterns in AtomicU32 so both contexts can touch the
// storage without `unsafe`; the release/acquire pair on the state tag orders them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Configuration constants for buffer pool
pub const DEFAULT_BUFFER_COUNT: usize = 3;
pub const MIN_BUFFER_COUNT: usize = 2;

/// Lifecycle tag of a single buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BufferState {
    Stale = 0,
    Filling = 1,
    Filled = 2,
    Reading = 3,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BufferState::Filling,
            2 => BufferState::Filled,
            3 => BufferState::Reading,
            _ => BufferState::Stale,
        }
    }
}

/// One buffer of the ring
///
/// Holds one sample array per channel. Every accessor takes `&self`; which
/// context may call the writing accessors is decided by the state tag.
pub struct SoundBuffer {
    state: AtomicU8,
    logical_index: AtomicU64,
    valid_frames: AtomicUsize,
    is_final: AtomicBool,
    channels: Box<[Box<[AtomicU32]>]>,
    capacity: usize,
}

impl SoundBuffer {
    fn new(capacity: usize, channel_count: usize) -> Result<Self, AudioError> {
        let mut channels = Vec::new();
        channels
            .try_reserve_exact(channel_count)
            .map_err(|_| AudioError::AllocationFailed {
                requested_frames: capacity,
            })?;

        for _ in 0..channel_count {
            let mut samples: Vec<AtomicU32> = Vec::new();
            samples
                .try_reserve_exact(capacity)
                .map_err(|_| AudioError::AllocationFailed {
                    requested_frames: capacity,
                })?;
            samples.extend((0..capacity).map(|_| AtomicU32::new(0)));
            channels.push(samples.into_boxed_slice());
        }

        Ok(Self {
            state: AtomicU8::new(BufferState::Stale as u8),
            logical_index: AtomicU64::new(0),
            valid_frames: AtomicUsize::new(0),
            is_final: AtomicBool::new(false),
            channels: channels.into_boxed_slice(),
            capacity,
        })
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `from` to `to`; false if the tag was not `from`
    pub fn try_transition(&self, from: BufferState, to: BufferState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Logical position of this buffer in the decoded stream
    pub fn logical_index(&self) -> u64 {
        self.logical_index.load(Ordering::Relaxed)
    }

    /// Frames of real audio; the rest of the buffer is zero padding
    pub fn valid_frames(&self) -> usize {
        self.valid_frames.load(Ordering::Relaxed)
    }

    /// Last buffer of the stream
    pub fn is_final(&self) -> bool {
        self.is_final.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn read_sample(&self, channel: usize, frame: usize) -> f32 {
        f32::from_bits(self.channels[channel][frame].load(Ordering::Relaxed))
    }

    /// Write `samples` into `channel` starting at frame `offset`
    pub fn write_channel(&self, channel: usize, offset: usize, samples: &[f32]) {
        let slots = &self.channels[channel][offset..offset + samples.len()];
        for (slot, sample) in slots.iter().zip(samples) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    /// Zero every channel from `frame` to capacity
    pub fn zero_from(&self, frame: usize) {
        let zero = 0.0_f32.to_bits();
        for channel in self.channels.iter() {
            for slot in channel.iter().skip(frame) {
                slot.store(zero, Ordering::Relaxed);
            }
        }
    }

    /// Record the fill result and hand the buffer to the render callback
    pub(crate) fn publish(&self, logical_index: u64, valid_frames: usize, is_final: bool) {
        self.logical_index.store(logical_index, Ordering::Relaxed);
        self.valid_frames.store(valid_frames, Ordering::Relaxed);
        self.is_final.store(is_final, Ordering::Relaxed);
        self.set_state(BufferState::Filled);
    }

    pub(crate) fn reset(&self) {
        self.valid_frames.store(0, Ordering::Relaxed);
        self.is_final.store(false, Ordering::Relaxed);
        self.set_state(BufferState::Stale);
    }
}

/// Census of buffer states, for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub stale: usize,
    pub filling: usize,
    pub filled: usize,
    pub reading: usize,
}

/// Fixed set of fixed-capacity buffers
///
/// The pool performs no locking. `allocate` needs `&mut self`, so it can only
/// run while no other context holds the pool; afterwards the ring is never
/// resized.
///
/// # Example
/// ```ignore
/// let mut pool = BufferPool::empty();
/// pool.allocate(3, 1024, 2)?;
///
/// // Cycler thread:
/// let buffer = pool.buffer_at(0);
/// if buffer.try_transition(BufferState::Stale, BufferState::Filling) {
///     buffer.write_channel(0, 0, &left);
///     buffer.publish(0, left.len(), false);
/// }
/// ```
pub struct BufferPool {
    buffers: Box<[SoundBuffer]>,
    frames_per_buffer: usize,
    channel_count: usize,
}

impl BufferPool {
    /// Pool with no storage; call `allocate` before use
    pub fn empty() -> Self {
        Self {
            buffers: Box::new([]),
            frames_per_buffer: 0,
            channel_count: 0,
        }
    }

    /// Allocated pool in one step
    pub fn new(
        num_buffers: usize,
        frames_per_buffer: usize,
        channel_count: usize,
    ) -> Result<Self, AudioError> {
        let mut pool = Self::empty();
        pool.allocate(num_buffers, frames_per_buffer, channel_count)?;
        Ok(pool)
    }

    /// Size the pool
    ///
    /// Identical parameters are a no-op and return `Ok(false)`; anything else
    /// frees the current storage and reallocates, returning `Ok(true)`.
    ///
    /// # Errors
    /// - `InvalidBufferCount` if `num_buffers < 2`
    /// - `InvalidConfig` for zero frames or a channel count other than 1 or 2
    /// - `AllocationFailed` if the memory cannot be reserved
    ///
    /// # Performance
    /// All allocation happens here, keeping the render thread allocation-free.
    pub fn allocate(
        &mut self,
        num_buffers: usize,
        frames_per_buffer: usize,
        channel_count: usize,
    ) -> Result<bool, AudioError> {
        if num_buffers < MIN_BUFFER_COUNT {
            return Err(AudioError::InvalidBufferCount { count: num_buffers });
        }
        if frames_per_buffer == 0 {
            return Err(AudioError::InvalidConfig {
                reason: "frames_per_buffer must be greater than 0".to_string(),
            });
        }
        if !(1..=2).contains(&channel_count) {
            return Err(AudioError::InvalidConfig {
                reason: format!("channel count must be 1 or 2 (got {})", channel_count),
            });
        }

        if self.buffers.len() == num_buffers
            && self.frames_per_buffer == frames_per_buffer
            && self.channel_count == channel_count
        {
            return Ok(false);
        }

        let total_frames = num_buffers
            .checked_mul(frames_per_buffer)
            .filter(|frames| frames.checked_mul(channel_count * 4).is_some())
            .ok_or(AudioError::AllocationFailed {
                requested_frames: usize::MAX,
            })?;

        // Release the old ring before reserving the new one.
        self.buffers = Box::new([]);
        self.frames_per_buffer = 0;
        self.channel_count = 0;

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(num_buffers)
            .map_err(|_| AudioError::AllocationFailed {
                requested_frames: total_frames,
            })?;
        for _ in 0..num_buffers {
            buffers.push(SoundBuffer::new(frames_per_buffer, channel_count).map_err(
                |_| AudioError::AllocationFailed {
                    requested_frames: total_frames,
                },
            )?);
        }

        self.buffers = buffers.into_boxed_slice();
        self.frames_per_buffer = frames_per_buffer;
        self.channel_count = channel_count;

        log::debug!(
            "[BufferPool] Allocated {} buffers x {} frames x {} channels",
            num_buffers,
            frames_per_buffer,
            channel_count
        );
        Ok(true)
    }

    /// Buffer at ring position `index`
    ///
    /// # Panics
    /// Panics if `index >= len()`
    pub fn buffer_at(&self, index: usize) -> &SoundBuffer {
        &self.buffers[index]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Ring successor of `index`
    #[inline]
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.buffers.len()
    }

    /// Reset every buffer to Stale with no valid frames
    ///
    /// Only valid while neither the render callback nor the cycler is
    /// touching the pool.
    pub fn mark_all_stale(&self) {
        for buffer in self.buffers.iter() {
            buffer.reset();
        }
    }

    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus::default();
        for buffer in self.buffers.iter() {
            match buffer.state() {
                BufferState::Stale => status.stale += 1,
                BufferState::Filling => status.filling += 1,
                BufferState::Filled => status.filled += 1,
                BufferState::Reading => status.reading += 1,
            }
        }
        status
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::empty()
    }
}
