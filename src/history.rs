use crate::cascade::wrap_degrees;
use crate::config::EstimatorConfig;
use crate::decoder::FrameDecoder;
use crate::filter::Butterworth;
use crate::types::{FilteredPose, Pose, RawSample};
use crate::{ControlError, Result};
use std::collections::VecDeque;

/// Index of the yaw channel in a pose row.
const YAW: usize = 3;

/// Turn a wrapped angle series into a continuous one by accumulating the
/// wrapped difference between neighbours, starting from the first sample.
fn unwrap_degrees<I>(angles: I) -> impl Iterator<Item = f64>
where
    I: IntoIterator<Item = f64>,
{
    angles.into_iter().scan(None, |prev: &mut Option<(f64, f64)>, angle| {
        let unwrapped = match *prev {
            Some((raw, acc)) => acc + wrap_degrees(angle - raw),
            None => angle,
        };
        *prev = Some((angle, unwrapped));
        Some(unwrapped)
    })
}

/// Fixed-capacity FIFO of pose rows, one column per state channel.
#[derive(Debug, Clone)]
pub struct SlidingBuffer {
    rows: VecDeque<[f64; Pose::DIM]>,
    capacity: usize,
}

impl SlidingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a row, evicting the oldest one when full.
    pub fn push(&mut self, row: [f64; Pose::DIM]) {
        if self.rows.len() == self.capacity {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-to-newest values of one channel.
    pub fn column(&self, channel: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |row| row[channel])
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Rolling pose estimator.
///
/// Tracked samples are decoded; lost samples are bridged by linear
/// extrapolation from the two most recent filtered poses, at most
/// `extrapolation_max` times in a row. Every accepted pose enters the sliding
/// window, and once the window has filled the Butterworth filter runs over
/// each channel and its last output becomes the new filtered pose.
#[derive(Debug, Clone)]
pub struct FrameHistory {
    decoder: FrameDecoder,
    buffer: SlidingBuffer,
    filter: Option<Butterworth>,
    extrapolating: bool,
    extrapolation_max: u32,
    loss_count: u32,
    /// [current, previous, previous-previous]
    filtered: [Option<FilteredPose>; 3],
}

impl FrameHistory {
    pub fn new(config: &EstimatorConfig) -> Result<FrameHistory> {
        if config.buffer_capacity == 0 {
            return Err(ControlError::Config("buffer_capacity must be at least 1".into()));
        }
        let filter = if config.filtering {
            Some(Butterworth::from_config(&config.filter)?)
        } else {
            None
        };
        Ok(FrameHistory {
            decoder: FrameDecoder::new(),
            buffer: SlidingBuffer::new(config.buffer_capacity),
            filter,
            extrapolating: config.extrapolating,
            extrapolation_max: config.extrapolation_max,
            loss_count: 0,
            filtered: [None; 3],
        })
    }

    /// Feed one sample. `None` means there is no usable pose this cycle.
    pub fn update(&mut self, sample: &RawSample) -> Option<FilteredPose> {
        let pose = if sample.detected {
            self.loss_count = 0;
            self.decoder.decode(sample)
        } else {
            self.extrapolate(sample.timestamp_s)?
        };

        self.buffer.push(pose.to_array());

        let smoothed = match &self.filter {
            Some(filter) => {
                if !self.buffer.is_full() {
                    log::trace!(
                        "Filter warming up ({}/{})",
                        self.buffer.len(),
                        self.buffer.capacity()
                    );
                    return None;
                }
                let mut row = [0.0; Pose::DIM];
                for (channel, value) in row.iter_mut().enumerate() {
                    *value = if channel == YAW {
                        filter.last_output(unwrap_degrees(self.buffer.column(YAW)))?
                    } else {
                        filter.last_output(self.buffer.column(channel))?
                    };
                }
                row[YAW] = wrap_degrees(row[YAW]);
                Pose::from_array(&row)
            }
            None => pose,
        };

        let filtered = FilteredPose {
            pose: smoothed,
            timestamp_s: sample.timestamp_s,
        };
        self.filtered = [Some(filtered), self.filtered[0], self.filtered[1]];
        Some(filtered)
    }

    /// Predict the pose at `now` from the last two filtered poses.
    fn extrapolate(&mut self, now: f64) -> Option<Pose> {
        if !self.extrapolating {
            return None;
        }
        if self.loss_count >= self.extrapolation_max {
            log::debug!(
                "Tracking lost for {} frames, extrapolation exhausted",
                self.loss_count
            );
            return None;
        }
        let (p1, p2) = match (self.filtered[0], self.filtered[1]) {
            (Some(p1), Some(p2)) => (p1, p2),
            _ => return None,
        };
        let span = p1.timestamp_s - p2.timestamp_s;
        if !(span.is_finite() && span > 0.0) {
            return None;
        }

        let a1 = p1.pose.to_array();
        let a2 = p2.pose.to_array();
        let ahead = now - p1.timestamp_s;
        let mut row = [0.0; Pose::DIM];
        for (channel, value) in row.iter_mut().enumerate() {
            let mut diff = a1[channel] - a2[channel];
            if channel == YAW {
                diff = wrap_degrees(diff);
            }
            *value = a1[channel] + diff / span * ahead;
        }
        row[YAW] = wrap_degrees(row[YAW]);

        self.loss_count += 1;
        log::debug!(
            "Extrapolated pose {}/{} ({:.4}s ahead)",
            self.loss_count,
            self.extrapolation_max,
            ahead
        );
        Some(Pose::from_array(&row))
    }

    /// Latest filtered pose, if any.
    pub fn filtered(&self) -> Option<FilteredPose> {
        self.filtered[0]
    }

    /// Consecutive frames bridged by extrapolation.
    pub fn loss_count(&self) -> u32 {
        self.loss_count
    }

    /// Whether the smoothing window has filled (always true with filtering off).
    pub fn is_warm(&self) -> bool {
        self.filter.is_none() || self.buffer.is_full()
    }

    pub fn buffer(&self) -> &SlidingBuffer {
        &self.buffer
    }

    /// Forget every retained pose.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.filtered = [None; 3];
        self.loss_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    const DT: f64 = 1.0 / 120.0;

    fn raw_config(extrapolation_max: u32) -> EstimatorConfig {
        EstimatorConfig {
            filtering: false,
            extrapolating: true,
            extrapolation_max,
            buffer_capacity: 100,
            filter: FilterConfig::default(),
        }
    }

    /// Motion-capture position for a desired control-frame position.
    fn mocap(x: f64, y: f64, z: f64) -> [f64; 3] {
        [x, z, -y]
    }

    #[test]
    fn test_sliding_buffer_evicts_oldest() {
        let mut buf = SlidingBuffer::new(3);
        for i in 0..5 {
            buf.push([i as f64; Pose::DIM]);
        }
        assert!(buf.is_full());
        assert_eq!(buf.column(0).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_detected_sample_passes_through_unfiltered() {
        let mut history = FrameHistory::new(&raw_config(3)).unwrap();
        let out = history
            .update(&RawSample::tracked(mocap(0.1, 0.2, 0.3), 0.0))
            .unwrap();
        assert!((out.pose.x - 0.1).abs() < 1e-12);
        assert!((out.pose.y - 0.2).abs() < 1e-12);
        assert!((out.pose.z - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_extrapolation_is_linear_and_bounded() {
        let max = 4;
        let mut history = FrameHistory::new(&raw_config(max)).unwrap();
        // Constant velocity V = (0.5, -0.25, 1.0) m/s.
        let v = [0.5, -0.25, 1.0];
        let at = |t: f64| mocap(v[0] * t, v[1] * t, v[2] * t);

        history.update(&RawSample::tracked(at(0.0), 0.0)).unwrap();
        history.update(&RawSample::tracked(at(DT), DT)).unwrap();

        for k in 1..=max {
            let t = DT * (1 + k) as f64;
            let prev = history.filtered().unwrap();
            let out = history.update(&RawSample::lost(t)).unwrap();
            let step = t - prev.timestamp_s;
            assert!((out.pose.x - (prev.pose.x + v[0] * step)).abs() < 1e-9);
            assert!((out.pose.y - (prev.pose.y + v[1] * step)).abs() < 1e-9);
            assert!((out.pose.z - (prev.pose.z + v[2] * step)).abs() < 1e-9);
            assert_eq!(history.loss_count(), k);
        }

        assert!(history.update(&RawSample::lost(DT * 10.0)).is_none());
        assert!(history.update(&RawSample::lost(DT * 11.0)).is_none());

        // Reacquisition resets the loss counter.
        assert!(history
            .update(&RawSample::tracked(at(DT * 12.0), DT * 12.0))
            .is_some());
        assert_eq!(history.loss_count(), 0);
    }

    #[test]
    fn test_extrapolation_needs_two_poses() {
        let mut history = FrameHistory::new(&raw_config(5)).unwrap();
        assert!(history.update(&RawSample::lost(0.0)).is_none());
        history.update(&RawSample::tracked([0.0; 3], DT)).unwrap();
        assert!(history.update(&RawSample::lost(2.0 * DT)).is_none());
    }

    #[test]
    fn test_extrapolation_disabled() {
        let mut config = raw_config(5);
        config.extrapolating = false;
        let mut history = FrameHistory::new(&config).unwrap();
        history.update(&RawSample::tracked([0.0; 3], 0.0)).unwrap();
        history.update(&RawSample::tracked([0.0; 3], DT)).unwrap();
        assert!(history.update(&RawSample::lost(2.0 * DT)).is_none());
    }

    #[test]
    fn test_extrapolated_yaw_stays_wrapped() {
        let mut history = FrameHistory::new(&raw_config(5)).unwrap();
        // Heading about the vertical (mocap Y) axis: 170 then 178 degrees.
        for (i, yaw) in [170.0f64, 178.0].iter().enumerate() {
            let half = (yaw / 2.0).to_radians();
            let sample = RawSample {
                quaternion: [0.0, half.sin(), 0.0, half.cos()],
                ..RawSample::tracked([0.0; 3], i as f64 * DT)
            };
            history.update(&sample).unwrap();
        }
        let out = history.update(&RawSample::lost(2.0 * DT)).unwrap();
        // 178 + 8 = 186 wraps to -174.
        assert!((out.pose.yaw - (-174.0)).abs() < 1e-6);
    }

    #[test]
    fn test_filter_warm_up() {
        let config = EstimatorConfig {
            filtering: true,
            buffer_capacity: 100,
            ..EstimatorConfig::default()
        };
        let mut history = FrameHistory::new(&config).unwrap();
        let sample = |k: usize| RawSample::tracked(mocap(1.0, -2.0, 0.5), k as f64 * DT);

        for k in 0..99 {
            assert!(history.update(&sample(k)).is_none());
            assert!(!history.is_warm());
        }
        let out = history.update(&sample(99)).unwrap();
        assert!(history.is_warm());
        assert!((out.pose.x - 1.0).abs() < 1e-6);
        assert!((out.pose.y + 2.0).abs() < 1e-6);
        assert!((out.pose.z - 0.5).abs() < 1e-6);

        // Stays warm from here on.
        assert!(history.update(&sample(100)).is_some());
    }

    #[test]
    fn test_filtered_noise_is_smoothed() {
        let config = EstimatorConfig::default();
        let mut history = FrameHistory::new(&config).unwrap();
        let mut out = None;
        for k in 0..100 {
            let jitter = if k % 2 == 0 { 0.01 } else { -0.01 };
            out = history.update(&RawSample::tracked(mocap(0.0, 0.0, 1.0 + jitter), k as f64 * DT));
        }
        let out = out.unwrap();
        assert!((out.pose.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unwrap_degrees_is_continuous() {
        let out: Vec<f64> = unwrap_degrees([170.0, 179.0, -179.0, -170.0, 175.0]).collect();
        assert_eq!(out, vec![170.0, 179.0, 181.0, 190.0, 175.0]);
    }

    #[test]
    fn test_filtered_yaw_across_wrap() {
        let config = EstimatorConfig {
            filtering: true,
            ..EstimatorConfig::default()
        };
        let mut history = FrameHistory::new(&config).unwrap();
        let mut out = None;
        for k in 0..100 {
            let yaw: f64 = if k % 2 == 0 { 179.5 } else { 180.5 };
            let half = (yaw / 2.0).to_radians();
            let sample = RawSample {
                quaternion: [0.0, half.sin(), 0.0, half.cos()],
                ..RawSample::tracked([0.0; 3], k as f64 * DT)
            };
            out = history.update(&sample);
        }
        let yaw = out.unwrap().pose.yaw;
        assert!(yaw.abs() > 179.0, "filtered yaw {}", yaw);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut history = FrameHistory::new(&raw_config(5)).unwrap();
        history.update(&RawSample::tracked([0.0; 3], 0.0)).unwrap();
        history.update(&RawSample::tracked([0.0; 3], DT)).unwrap();
        history.reset();
        assert!(history.filtered().is_none());
        assert!(history.buffer().is_empty());
        assert!(history.update(&RawSample::lost(2.0 * DT)).is_none());
    }
}
