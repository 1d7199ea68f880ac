use super::tap::TapSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub type SharedTimeline = Arc<Mutex<Timeline>>;

/// Lock the timeline, recovering from a poisoned lock. The render callback must keep running even
/// if some other thread panicked while holding it.
pub fn lock_timeline(timeline: &SharedTimeline) -> MutexGuard<'_, Timeline> {
    match timeline.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Position of one buffer on the output clock, in frames at the session sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub start_frame: u64,
    pub end_frame: u64,
}

impl ScheduledSlot {
    pub fn frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }

    pub fn overlaps(&self, other: &ScheduledSlot) -> bool {
        self.start_frame < other.end_frame && other.start_frame < self.end_frame
    }

    pub fn start_time(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.start_frame as f64 / sample_rate as f64)
    }
}

#[derive(Debug)]
struct ScheduledBuffer {
    slot: ScheduledSlot,
    /// Shared with the taps so the render path never copies samples.
    samples: Arc<[f32]>,
    arrived_at: Instant,
    tapped: bool,
}

/// Output clock plus the queue of buffers scheduled against it.
///
/// The clock only advances when the device renders, so it is the single source of "now" for
/// scheduling decisions.
pub struct Timeline {
    sample_rate: u32,
    lookahead_frames: u64,
    clock: u64,
    cursor: Option<u64>,
    queue: VecDeque<ScheduledBuffer>,
    taps: TapSet,
}

impl Timeline {
    pub fn new(sample_rate: u32, lookahead: Duration) -> Self {
        Self {
            sample_rate,
            lookahead_frames: (lookahead.as_secs_f64() * sample_rate as f64).round() as u64,
            clock: 0,
            cursor: None,
            queue: VecDeque::new(),
            taps: TapSet::default(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered by the device so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// End of the most recently scheduled buffer, `None` when unset.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn taps_mut(&mut self) -> &mut TapSet {
        &mut self.taps
    }

    /// Place `samples` back-to-back after whatever is already queued. When nothing is queued the
    /// buffer starts one look-ahead past the current clock.
    pub fn schedule(&mut self, samples: Vec<f32>, arrived_at: Instant) -> ScheduledSlot {
        let start_frame = match (self.cursor, self.queue.is_empty()) {
            (Some(end), false) => end.max(self.clock),
            _ => self.clock + self.lookahead_frames,
        };
        let slot = ScheduledSlot {
            start_frame,
            end_frame: start_frame + samples.len() as u64,
        };

        if samples.is_empty() {
            return slot;
        }

        log::trace!(
            "Timeline: scheduled {} frames at {} (clock {}, queued {})",
            slot.frames(),
            slot.start_frame,
            self.clock,
            self.queue.len()
        );
        self.cursor = Some(slot.end_frame);
        self.queue.push_back(ScheduledBuffer {
            slot,
            samples: Arc::from(samples),
            arrived_at,
            tapped: false,
        });
        slot
    }

    /// Fill `out` with the next mono frames and advance the clock. Frames with nothing scheduled
    /// are silence.
    pub fn render(&mut self, out: &mut [f32]) {
        for (i, value) in out.iter_mut().enumerate() {
            let frame = self.clock + i as u64;
            self.release_until(frame);

            *value = match self.queue.front_mut() {
                Some(buffer) if buffer.slot.start_frame <= frame => {
                    if !buffer.tapped {
                        buffer.tapped = true;
                        log::trace!(
                            "Timeline: buffer started {:?} after arrival",
                            buffer.arrived_at.elapsed()
                        );
                        self.taps.publish(&buffer.samples);
                    }
                    buffer.samples[(frame - buffer.slot.start_frame) as usize]
                }
                _ => 0.0,
            };
        }
        self.clock += out.len() as u64;
        self.release_until(self.clock);
    }

    /// Drop every queued buffer, playing or not, and unset the cursor.
    pub fn flush(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.cursor = None;
        dropped
    }

    fn release_until(&mut self, frame: u64) {
        while self
            .queue
            .front()
            .map(|buffer| buffer.slot.end_frame <= frame)
            .unwrap_or(false)
        {
            self.queue.pop_front();
        }
    }
}
