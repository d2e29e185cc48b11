//! Decoded frames and the drop-oldest queue that hands them between stages.
//!
//! - `Frame`: RGB24 pixels plus a per-camera sequence number and capture timestamps.
//!   A frame moves capture → queue → consumer by value; the only copies are the ones
//!   made explicitly for the last-frame cache.
//! - `FrameQueue`: bounded buffer that evicts the oldest item instead of blocking.
//! - Pixel helpers used by capture (motion magnitude), tracking (sharpness) and
//!   snapshots (downscale, JPEG).

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

/// Largest frame handed to diagnostic consumers; bigger frames are downscaled.
pub const MAX_SNAPSHOT_WIDTH: u32 = 1920;
pub const MAX_SNAPSHOT_HEIGHT: u32 = 1080;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per source, starting at 1.
    pub seq: u64,
    pub captured_at: Instant,
    pub wall_clock: SystemTime,
}

impl Frame {
    /// Wraps RGB24 pixels. The buffer length must be exactly `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
            captured_at: Instant::now(),
            wall_clock: SystemTime::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Copies the rectangle `[x, x+w) x [y, y+h)` clamped to the frame. Returns `None`
    /// when the clamped rectangle is empty.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Option<Frame> {
        let x0 = x.min(self.width);
        let y0 = y.min(self.height);
        let x1 = x.saturating_add(w).min(self.width);
        let y1 = y.saturating_add(h).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let row_bytes = self.width as usize * 3;
        let mut out = Vec::with_capacity(((x1 - x0) * (y1 - y0) * 3) as usize);
        for row in y0..y1 {
            let start = row as usize * row_bytes + x0 as usize * 3;
            let end = row as usize * row_bytes + x1 as usize * 3;
            out.extend_from_slice(&self.data[start..end]);
        }
        Some(Frame {
            data: out,
            width: x1 - x0,
            height: y1 - y0,
            seq: self.seq,
            captured_at: self.captured_at,
            wall_clock: self.wall_clock,
        })
    }

    /// Returns a copy no larger than `max_width` x `max_height`, preserving aspect ratio.
    /// Frames already within bounds are returned unchanged.
    pub fn downscale_to_fit(self, max_width: u32, max_height: u32) -> Result<Frame> {
        if self.width <= max_width && self.height <= max_height {
            return Ok(self);
        }
        let scale = f64::min(
            max_width as f64 / self.width as f64,
            max_height as f64 / self.height as f64,
        );
        let new_w = ((self.width as f64 * scale).floor() as u32).max(1);
        let new_h = ((self.height as f64 * scale).floor() as u32).max(1);
        let image = RgbImage::from_raw(self.width, self.height, self.data)
            .context("frame buffer does not match its dimensions")?;
        let resized =
            image::imageops::resize(&image, new_w, new_h, image::imageops::FilterType::Triangle);
        Ok(Frame {
            data: resized.into_raw(),
            width: new_w,
            height: new_h,
            seq: self.seq,
            captured_at: self.captured_at,
            wall_clock: self.wall_clock,
        })
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }

    /// Luma plane (BT.601 integer weights).
    pub fn to_gray(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8)
            .collect()
    }
}

/// Byte length of a `width` x `height` RGB24 buffer; errors on overflow.
pub fn rgb_len(width: u32, height: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

/// Mean absolute difference between two equally sized gray planes. Mismatched
/// planes count as maximal motion.
pub fn mean_abs_diff(a: &[u8], b: &[u8]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 255.0;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (*x as i16 - *y as i16).unsigned_abs() as u64)
        .sum();
    total as f32 / a.len() as f32
}

/// Variance of the 4-neighbour Laplacian over the interior of a gray plane.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f64 {
    let (w, h) = (width as usize, height as usize);
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as f64;
            let lap = gray[(y - 1) * w + x] as f64
                + gray[(y + 1) * w + x] as f64
                + gray[y * w + x - 1] as f64
                + gray[y * w + x + 1] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }
    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0)
}

// ----------------------------------------------------------------------------
// FrameQueue: bounded, drop-oldest
// ----------------------------------------------------------------------------

/// Bounded buffer between a producer loop and a consumer loop.
///
/// `push` never blocks: at capacity the oldest item is evicted first. `pop_latest`
/// hands back only the newest item and discards the rest.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    dropped: u64,
}

impl<T> FrameQueue<T> {
    /// `capacity` is raised to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `item`, evicting the oldest entry when full. Returns the number of
    /// items evicted (0 or 1).
    pub fn push(&self, item: T) -> usize {
        let mut state = self.lock();
        let mut evicted = 0;
        while state.items.len() >= self.capacity {
            state.items.pop_front();
            evicted += 1;
        }
        state.dropped += evicted as u64;
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        evicted
    }

    /// Takes the newest item and discards everything older.
    pub fn pop_latest(&self) -> Option<T> {
        let mut state = self.lock();
        Self::take_latest(&mut state)
    }

    /// Like `pop_latest`, but waits up to `timeout` for an item to arrive.
    pub fn pop_latest_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.items.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Self::take_latest(&mut state)
    }

    fn take_latest(state: &mut QueueState<T>) -> Option<T> {
        let latest = state.items.pop_back();
        let stale = state.items.len() as u64;
        state.items.clear();
        state.dropped += stale;
        latest
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items discarded by eviction or by `pop_latest` since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(vec![value; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let queue = FrameQueue::new(2);
        for i in 0..10 {
            queue.push(i);
            assert!(queue.len() <= 2);
        }
        assert_eq!(queue.dropped(), 8);
    }

    #[test]
    fn pop_latest_returns_newest_and_empties() {
        let queue = FrameQueue::new(3);
        queue.push("a");
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.pop_latest(), Some("c"));
        assert!(queue.is_empty());
        assert_eq!(queue.pop_latest(), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.push(1), 0);
        assert_eq!(queue.push(2), 1);
        assert_eq!(queue.pop_latest(), Some(2));
    }

    #[test]
    fn pop_latest_timeout_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(1));
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(7u32);
        });
        assert_eq!(queue.pop_latest_timeout(Duration::from_secs(2)), Some(7));
        handle.join().unwrap();
        assert_eq!(queue.pop_latest_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn frame_rejects_wrong_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, 1).is_err());
    }

    #[test]
    fn downscale_preserves_aspect_ratio() -> Result<()> {
        let frame = solid(3840, 2160, 10).downscale_to_fit(MAX_SNAPSHOT_WIDTH, MAX_SNAPSHOT_HEIGHT)?;
        assert_eq!((frame.width, frame.height), (1920, 1080));
        let small = solid(64, 48, 10).downscale_to_fit(MAX_SNAPSHOT_WIDTH, MAX_SNAPSHOT_HEIGHT)?;
        assert_eq!((small.width, small.height), (64, 48));
        Ok(())
    }

    #[test]
    fn crop_clamps_to_bounds() {
        let frame = solid(10, 10, 3);
        let crop = frame.crop(8, 8, 5, 5).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.byte_len(), 12);
        assert!(frame.crop(10, 0, 5, 5).is_none());
    }

    #[test]
    fn jpeg_starts_with_soi_marker() -> Result<()> {
        let bytes = solid(16, 16, 128).encode_jpeg(DEFAULT_JPEG_QUALITY)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn flat_image_has_no_laplacian_energy() {
        let gray = vec![50u8; 25];
        assert_eq!(laplacian_variance(&gray, 5, 5), 0.0);
        let mut checker = vec![0u8; 25];
        for (i, px) in checker.iter_mut().enumerate() {
            *px = if i % 2 == 0 { 255 } else { 0 };
        }
        assert!(laplacian_variance(&checker, 5, 5) > 1000.0);
    }

    #[test]
    fn motion_magnitude_of_identical_planes_is_zero() {
        let a = vec![9u8; 16];
        assert_eq!(mean_abs_diff(&a, &a), 0.0);
        assert_eq!(mean_abs_diff(&a, &[19u8; 16]), 10.0);
    }
}
