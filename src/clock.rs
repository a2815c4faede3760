//! Frame clock and shared time records.
//!
//! The frame counter advances once per driver period on the cycle thread
//! and must be readable by every client without taking a lock. The
//! two-guard-word protocol below is a sequence lock: the writer parks
//! `guard1` on an odd value while the fields are in flux, then republishes
//! both guards on the next even value. A reader accepts a snapshot only
//! when both guards agree on an even value.

use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Transport is stopped; the frame position is not advancing.
pub const TRANSPORT_STOPPED: u32 = 0;
/// Transport is rolling.
pub const TRANSPORT_ROLLING: u32 = 1;

/// `TimeInfo::valid` bit: `transport_state` carries meaning.
pub const VALID_TRANSPORT_STATE: u32 = 1 << 0;
/// `TimeInfo::valid` bit: `frame` carries meaning.
pub const VALID_TRANSPORT_POSITION: u32 = 1 << 1;

/// One snapshot of engine time, shared with every client.
///
/// The engine owns `usecs` and `frame_rate`; the timebase client is the
/// sole writer of the remaining fields between cycles.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TimeInfo {
    /// Microsecond stamp of the cycle that produced this snapshot.
    pub usecs: u64,
    /// Transport position in frames.
    pub frame: u32,
    /// Sample rate in frames per second.
    pub frame_rate: u32,
    /// One of [`TRANSPORT_STOPPED`], [`TRANSPORT_ROLLING`].
    pub transport_state: u32,
    /// Bitmask of `VALID_*` flags describing which fields are meaningful.
    pub valid: u32,
}

impl TimeInfo {
    pub const fn zeroed() -> Self {
        Self {
            usecs: 0,
            frame: 0,
            frame_rate: 0,
            transport_state: TRANSPORT_STOPPED,
            valid: VALID_TRANSPORT_STATE | VALID_TRANSPORT_POSITION,
        }
    }

    /// The post-process rotation: `pending` becomes `current`, except that
    /// `usecs` and `frame_rate` are owned by the engine and carried over
    /// from the outgoing snapshot.
    pub fn rotated_from(pending: TimeInfo, current: TimeInfo) -> TimeInfo {
        TimeInfo {
            usecs: current.usecs,
            frame_rate: current.frame_rate,
            ..pending
        }
    }
}

/// Lock-free frame counter with the two-guard-word read protocol.
///
/// Lives inside the shared control segment; all fields are atomics so both
/// sides of the mapping observe well-defined values.
#[repr(C)]
pub struct FrameTimer {
    guard1: AtomicU32,
    guard2: AtomicU32,
    frames: AtomicU32,
    stamp: AtomicU64,
}

impl FrameTimer {
    pub const fn new() -> Self {
        Self {
            guard1: AtomicU32::new(0),
            guard2: AtomicU32::new(0),
            frames: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
        }
    }

    /// Advance the frame counter by `nframes`, stamping the update with the
    /// driver's wake-up time. Cycle thread only.
    pub fn advance(&self, nframes: u32, stamp_usecs: u64) {
        let serial = self.guard1.load(Ordering::Relaxed).wrapping_add(1);
        // odd serial: readers started now will retry
        self.guard1.store(serial, Ordering::Relaxed);
        fence(Ordering::Release);

        let frames = self.frames.load(Ordering::Relaxed).wrapping_add(nframes);
        self.frames.store(frames, Ordering::Relaxed);
        self.stamp.store(stamp_usecs, Ordering::Relaxed);

        fence(Ordering::Release);
        let serial = serial.wrapping_add(1);
        self.guard2.store(serial, Ordering::Relaxed);
        self.guard1.store(serial, Ordering::Release);
    }

    /// Read a consistent `(frames, stamp)` pair without locking. Retries
    /// while a writer is mid-update.
    pub fn read(&self) -> (u32, u64) {
        loop {
            let g2 = self.guard2.load(Ordering::Acquire);
            let frames = self.frames.load(Ordering::Relaxed);
            let stamp = self.stamp.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let g1 = self.guard1.load(Ordering::Relaxed);
            if g1 == g2 && g1 & 1 == 0 {
                return (frames, stamp);
            }
            std::hint::spin_loop();
        }
    }
}

/// Monotonic microseconds since the first call in this process.
pub fn now_usecs() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_advance_and_read() {
        let timer = FrameTimer::new();
        timer.advance(256, 1000);
        timer.advance(256, 2000);
        assert_eq!(timer.read(), (512, 2000));
    }

    #[test]
    fn test_frames_monotonic_under_concurrent_reads() {
        let timer = Arc::new(FrameTimer::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let timer = timer.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut last = 0u32;
                    while !done.load(Ordering::Acquire) {
                        let (frames, stamp) = timer.read();
                        assert!(frames >= last, "frames went backwards");
                        // stamp tracks frames: both written in one update
                        assert_eq!(stamp, frames as u64 * 10);
                        last = frames;
                    }
                })
            })
            .collect();

        for i in 1..=10_000u32 {
            timer.advance(1, i as u64 * 10);
        }
        done.store(true, Ordering::Release);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(timer.read().0, 10_000);
    }

    #[test]
    fn test_rotation_preserves_engine_fields() {
        let current = TimeInfo {
            usecs: 999,
            frame: 10,
            frame_rate: 48_000,
            transport_state: TRANSPORT_STOPPED,
            valid: VALID_TRANSPORT_STATE,
        };
        let mut pending = current;
        pending.frame = 2048;
        pending.transport_state = TRANSPORT_ROLLING;
        pending.usecs = 0;
        pending.frame_rate = 0;

        let rotated = TimeInfo::rotated_from(pending, current);
        assert_eq!(rotated.usecs, 999);
        assert_eq!(rotated.frame_rate, 48_000);
        assert_eq!(rotated.frame, 2048);
        assert_eq!(rotated.transport_state, TRANSPORT_ROLLING);
    }

    #[test]
    fn test_now_usecs_monotonic() {
        let a = now_usecs();
        let b = now_usecs();
        assert!(b >= a);
    }
}
