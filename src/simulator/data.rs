//! Synthetic 4D-STEM data
//!
//! A scan is modelled as a navigator of grain labels (one label per scan
//! position) plus one diffraction pattern per label. Any frame, sum or virtual
//! image is derived from the handful of patterns instead of storing a full
//! 4D array.

use std::f64::consts::TAU;

/// Number of grains in the navigator
pub const NUM_GRAINS: usize = 4;

/// Grain seed positions as fractions of the scan extent
const SEEDS: [(f64, f64); NUM_GRAINS] = [(0.2, 0.3), (0.7, 0.2), (0.4, 0.8), (0.85, 0.75)];

/// Hardware region of interest and binning applied to raw patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorView {
    pub offset_x: usize,
    pub offset_y: usize,
    pub size_x: usize,
    pub size_y: usize,
    pub binning_x: usize,
    pub binning_y: usize,
}

impl DetectorView {
    /// Full sensor, no binning
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            size_x: width,
            size_y: height,
            binning_x: 1,
            binning_y: 1,
        }
    }

    /// `(width, height)` after cropping and binning
    pub fn output_size(&self) -> (usize, usize) {
        (
            self.size_x / self.binning_x.max(1),
            self.size_y / self.binning_y.max(1),
        )
    }
}

/// How a virtual image combines a mask with the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calculation {
    /// Sum of pixels where the mask is 2
    Sum,
    /// Sum where the mask is 2 minus sum where the mask is 0
    Difference,
}

impl Calculation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Some(Calculation::Sum),
            "difference" => Some(Calculation::Difference),
            _ => None,
        }
    }
}

/// Navigator labels and per-grain patterns
#[derive(Debug, Clone)]
pub struct ScanData {
    scan_width: usize,
    scan_height: usize,
    sensor_width: usize,
    sensor_height: usize,
    navigator: Vec<u8>,
    patterns: Vec<Vec<f32>>,
}

impl ScanData {
    pub fn new(scan_width: usize, scan_height: usize, sensor_width: usize, sensor_height: usize) -> Self {
        let scan_width = scan_width.max(1);
        let scan_height = scan_height.max(1);
        let navigator = grains(scan_width, scan_height);
        let patterns = (0..NUM_GRAINS)
            .map(|label| diffraction_pattern(sensor_width, sensor_height, label))
            .collect();
        Self {
            scan_width,
            scan_height,
            sensor_width,
            sensor_height,
            navigator,
            patterns,
        }
    }

    pub fn scan_size(&self) -> (usize, usize) {
        (self.scan_width, self.scan_height)
    }

    /// Number of scan positions
    pub fn len(&self) -> usize {
        self.navigator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.navigator.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.len().saturating_sub(1)
    }

    /// Flat scan index to `(row, col)`
    pub fn unravel(&self, index: usize) -> (usize, usize) {
        let index = index.min(self.last_index());
        (index / self.scan_width, index % self.scan_width)
    }

    pub fn label(&self, index: usize) -> usize {
        self.navigator[index.min(self.last_index())] as usize
    }

    /// Pattern seen at one scan position through `view`
    pub fn frame(&self, index: usize, view: &DetectorView) -> Vec<f32> {
        self.view_pattern(self.label(index), view)
    }

    /// Sum of the patterns over every scan position
    pub fn sum_total(&self, view: &DetectorView) -> Vec<f32> {
        let (w, h) = view.output_size();
        let mut out = vec![0f32; w * h];
        for label in 0..NUM_GRAINS {
            let count = self.navigator.iter().filter(|l| **l as usize == label).count();
            if count == 0 {
                continue;
            }
            let pattern = self.view_pattern(label, view);
            out.iter_mut()
                .zip(&pattern)
                .for_each(|(o, p)| *o += p * count as f32);
        }
        out
    }

    /// Scalar per scan position from a virtual detector mask
    ///
    /// The mask is resampled to the viewed pattern size when they differ.
    /// Returns `scan_width * scan_height` values in row-major order.
    pub fn virtual_image(
        &self,
        mask: &[u8],
        mask_width: usize,
        mask_height: usize,
        view: &DetectorView,
        calculation: Calculation,
    ) -> Vec<f32> {
        let (w, h) = view.output_size();
        let mask = if (mask_width, mask_height) == (w, h) {
            mask.to_vec()
        } else {
            resample(mask, mask_width, mask_height, w, h)
        };

        let per_label: Vec<f32> = (0..NUM_GRAINS)
            .map(|label| {
                let pattern = self.view_pattern(label, view);
                let (positive, negative) = pattern.iter().zip(&mask).fold(
                    (0f64, 0f64),
                    |(pos, neg), (p, m)| match m {
                        2 => (pos + *p as f64, neg),
                        0 => (pos, neg + *p as f64),
                        _ => (pos, neg),
                    },
                );
                match calculation {
                    Calculation::Sum => positive as f32,
                    Calculation::Difference => (positive - negative) as f32,
                }
            })
            .collect();

        self.navigator.iter().map(|l| per_label[*l as usize]).collect()
    }

    fn view_pattern(&self, label: usize, view: &DetectorView) -> Vec<f32> {
        let pattern = &self.patterns[label];
        let (out_w, out_h) = view.output_size();
        let bx = view.binning_x.max(1);
        let by = view.binning_y.max(1);
        let mut out = vec![0f32; out_w * out_h];

        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = 0f32;
                for dy in 0..by {
                    let y = view.offset_y + oy * by + dy;
                    if y >= self.sensor_height {
                        continue;
                    }
                    let row = y * self.sensor_width;
                    for dx in 0..bx {
                        let x = view.offset_x + ox * bx + dx;
                        if x < self.sensor_width {
                            acc += pattern[row + x];
                        }
                    }
                }
                out[oy * out_w + ox] = acc;
            }
        }
        out
    }
}

/// Nearest-neighbour resampling of a row-major buffer
pub fn resample<T: Copy + Default>(
    src: &[T],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<T> {
    if src_width == 0 || src_height == 0 || src.len() < src_width * src_height {
        return vec![T::default(); dst_width * dst_height];
    }
    let mut out = Vec::with_capacity(dst_width * dst_height);
    for y in 0..dst_height {
        let sy = y * src_height / dst_height.max(1);
        for x in 0..dst_width {
            let sx = x * src_width / dst_width.max(1);
            out.push(src[sy * src_width + sx]);
        }
    }
    out
}

/// Label every scan position with its nearest grain seed
fn grains(width: usize, height: usize) -> Vec<u8> {
    let mut labels = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let (y, x) = ((row as f64 + 0.5) / height as f64, (col as f64 + 0.5) / width as f64);
            let mut best = (f64::MAX, 0u8);
            for (label, (sx, sy)) in SEEDS.iter().enumerate() {
                let d = (x - sx).powi(2) + (y - sy).powi(2);
                if d < best.0 {
                    best = (d, label as u8);
                }
            }
            labels.push(best.1);
        }
    }
    labels
}

/// Central beam plus a ring of Bragg disks rotated per grain
fn diffraction_pattern(width: usize, height: usize, label: usize) -> Vec<f32> {
    let mut dp = vec![1f32; width * height];
    let size = width.min(height) as f64;
    let radius = size / 20.0;
    let distance = size * 0.3;
    let center = (width as f64 / 2.0, height as f64 / 2.0);
    let intensity = 10.0 * (label as f32 + 1.0);
    let rotation = label as f64;

    stamp_disk(&mut dp, width, height, center, radius, intensity * 10.0);
    for k in 0..6 {
        let theta = TAU * k as f64 / 6.0 + rotation;
        let c = (
            center.0 + theta.cos() * distance,
            center.1 + theta.sin() * distance,
        );
        stamp_disk(&mut dp, width, height, c, radius, intensity * 7.0);
    }
    dp
}

fn stamp_disk(dp: &mut [f32], width: usize, height: usize, c: (f64, f64), r: f64, value: f32) {
    let x0 = (c.0 - r).floor().max(0.0) as usize;
    let x1 = ((c.0 + r).ceil() as usize).min(width);
    let y0 = (c.1 - r).floor().max(0.0) as usize;
    let y1 = ((c.1 + r).ceil() as usize).min(height);
    for y in y0..y1 {
        for x in x0..x1 {
            let dx = x as f64 - c.0;
            let dy = y as f64 - c.1;
            if dx * dx + dy * dy < r * r {
                dp[y * width + x] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigator_uses_every_grain() {
        let data = ScanData::new(32, 32, 64, 64);
        assert_eq!(data.len(), 1024);
        for label in 0..NUM_GRAINS as u8 {
            assert!(data.navigator.contains(&label));
        }
        assert_eq!(data.unravel(33), (1, 1));
        assert_eq!(data.unravel(5000), (31, 31));
    }

    #[test]
    fn test_frame_has_central_beam() {
        let data = ScanData::new(4, 4, 64, 64);
        let view = DetectorView::full(64, 64);
        let frame = data.frame(0, &view);
        assert_eq!(frame.len(), 64 * 64);
        assert!(frame[32 * 64 + 32] > 1.0);
        assert_eq!(frame[0], 1.0);
    }

    #[test]
    fn test_view_crops_and_bins() {
        let data = ScanData::new(1, 1, 64, 64);
        let view = DetectorView {
            offset_x: 32,
            offset_y: 0,
            size_x: 32,
            size_y: 64,
            binning_x: 2,
            binning_y: 2,
        };
        assert_eq!(view.output_size(), (16, 32));
        let frame = data.frame(0, &view);
        assert_eq!(frame.len(), 16 * 32);
        // a 2x2 bin of background pixels
        assert_eq!(frame[0], 4.0);
    }

    #[test]
    fn test_virtual_image_sum_and_difference() {
        let data = ScanData::new(8, 8, 16, 16);
        let view = DetectorView::full(16, 16);
        let all_positive = vec![2u8; 256];
        let sum = data.virtual_image(&all_positive, 16, 16, &view, Calculation::Sum);
        assert_eq!(sum.len(), 64);
        let total: f32 = data.frame(0, &view).iter().sum();
        assert_eq!(sum[0], total);

        let all_negative = vec![0u8; 256];
        let diff = data.virtual_image(&all_negative, 16, 16, &view, Calculation::Difference);
        assert_eq!(diff[0], -total);

        let ignored = vec![1u8; 256];
        let zero = data.virtual_image(&ignored, 16, 16, &view, Calculation::Sum);
        assert!(zero.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_resample_nearest() {
        let src = [1u8, 2, 3, 4];
        assert_eq!(resample(&src, 2, 2, 4, 2), vec![1, 1, 2, 2, 3, 3, 4, 4]);
        assert_eq!(resample(&src, 2, 2, 1, 1), vec![1]);
    }

    #[test]
    fn test_calculation_parse() {
        assert_eq!(Calculation::parse("Sum"), Some(Calculation::Sum));
        assert_eq!(Calculation::parse("difference"), Some(Calculation::Difference));
        assert_eq!(Calculation::parse("Susd"), None);
    }
}
