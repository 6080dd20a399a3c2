//! Sequential reference implementation of histogram equalization.
//!
//! This is the single-threaded counterpart to the GPU pipeline in
//! [`crate::gpu`].  It exists both as a fallback when no adapter is
//! available and as the trusted reference that the parallel stages are
//! tested against.  The three stages mirror the GPU kernels exactly:
//! count bin occupancies, take the inclusive prefix sum, then remap
//! every pixel through a lookup table derived from the cumulative
//! counts.

/// Number of histogram bins; fixed by the 8-bit pixel depth.
pub const BINS: usize = 256;

/// Count the occupancy of each intensity value.
///
/// Returns a histogram where `bin[v]` is the number of samples equal
/// to `v`.  The bins are `u32` so images larger than 2^24 pixels do
/// not overflow.
pub fn histogram(pixels: &[u8]) -> [u32; BINS] {
    let mut hist = [0u32; BINS];
    for &p in pixels {
        hist[p as usize] += 1;
    }
    hist
}

/// Inclusive prefix sum of the histogram.
///
/// `cum[i]` is the number of samples with value `<= i`; `cum[255]`
/// equals the total pixel count.
pub fn cumulative_histogram(hist: &[u32; BINS]) -> [u32; BINS] {
    let mut cum = [0u32; BINS];
    let mut running = 0u32;
    for (c, &h) in cum.iter_mut().zip(hist.iter()) {
        running += h;
        *c = running;
    }
    cum
}

/// Derive the 256-entry equalization lookup table.
///
/// Normalizes each cumulative count relative to the count of the
/// lowest bin, so the darkest populated intensity maps toward zero:
///
/// ```text
/// lut[v] = round(255 * (cum[v] - cum[0]) / n)
/// ```
///
/// The result is clamped into `[0, 255]` to guard against rounding at
/// the top bin.  The total pixel count is taken from `cum[255]`; for
/// an empty image the table is all zero and callers must not apply it
/// (see [`equalize`]).
pub fn lookup_table(cum: &[u32; BINS]) -> [u8; BINS] {
    let n = cum[BINS - 1];
    let mut lut = [0u8; BINS];
    if n == 0 {
        return lut;
    }
    let base = cum[0] as f64;
    for (l, &c) in lut.iter_mut().zip(cum.iter()) {
        let v = (255.0 * (c as f64 - base) / n as f64).round();
        *l = v.clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Equalize a pixel buffer in place.
///
/// An empty buffer is left untouched; the lookup table would be
/// undefined for it.
pub fn equalize(pixels: &mut [u8]) {
    if pixels.is_empty() {
        return;
    }
    let hist = histogram(pixels);
    let cum = cumulative_histogram(&hist);
    let lut = lookup_table(&cum);
    for p in pixels.iter_mut() {
        *p = lut[*p as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_mass_equals_pixel_count() {
        let pixels: Vec<u8> = (0..10_000).map(|i| (i * 7 % 256) as u8).collect();
        let hist = histogram(&pixels);
        let total: u64 = hist.iter().map(|&h| h as u64).sum();
        assert_eq!(total, pixels.len() as u64);
    }

    #[test]
    fn cumulative_is_monotonic_and_ends_at_n() {
        let pixels: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let cum = cumulative_histogram(&histogram(&pixels));
        for i in 1..BINS {
            assert!(cum[i] >= cum[i - 1], "cumulative decreased at bin {i}");
        }
        assert_eq!(cum[BINS - 1], pixels.len() as u32);
    }

    #[test]
    fn cumulative_all_mass_in_one_bin() {
        let mut hist = [0u32; BINS];
        hist[128] = 77;
        let cum = cumulative_histogram(&hist);
        for i in 0..128 {
            assert_eq!(cum[i], 0);
        }
        for i in 128..BINS {
            assert_eq!(cum[i], 77);
        }
    }

    #[test]
    fn all_black_image_is_unchanged() {
        // 4x4 image, every pixel 0: the only populated bin normalizes
        // to (16 - 16) / 16 = 0, so the output is identical.
        let mut pixels = vec![0u8; 16];
        let hist = histogram(&pixels);
        assert_eq!(hist[0], 16);
        assert!(hist[1..].iter().all(|&h| h == 0));
        equalize(&mut pixels);
        assert!(pixels.iter().all(|&p| p == 0));
    }

    #[test]
    fn constant_image_maps_uniformly() {
        let mut pixels = vec![128u8; 4];
        equalize(&mut pixels);
        let v = pixels[0];
        assert!(pixels.iter().all(|&p| p == v));
    }

    #[test]
    fn ramp_preserves_ordering() {
        // 8x1 image with one pixel per populated bin: equalization must
        // keep the relative intensity ordering.
        let mut pixels = vec![0u8, 32, 64, 96, 128, 160, 192, 224];
        equalize(&mut pixels);
        for i in 1..pixels.len() {
            assert!(
                pixels[i] >= pixels[i - 1],
                "ordering violated at index {i}: {:?}",
                pixels
            );
        }
    }

    #[test]
    fn lut_values_stay_in_range() {
        let pixels: Vec<u8> = (0..50 * 50).map(|i| ((i * 3 + i / 50 * 7) % 256) as u8).collect();
        let lut = lookup_table(&cumulative_histogram(&histogram(&pixels)));
        // u8 already bounds the range; check monotonicity instead,
        // which the clamp must not break.
        for i in 1..BINS {
            assert!(lut[i] >= lut[i - 1]);
        }
    }

    #[test]
    fn low_contrast_input_expands_range() {
        let mut pixels: Vec<u8> = (0..110).map(|i| 100 + (i % 11) as u8).collect();
        equalize(&mut pixels);
        let min = *pixels.iter().min().unwrap();
        let max = *pixels.iter().max().unwrap();
        assert!(max - min > 100, "range {min}..{max} not expanded");
    }

    #[test]
    fn empty_input_is_a_noop() {
        let mut pixels: Vec<u8> = Vec::new();
        equalize(&mut pixels);
        assert!(pixels.is_empty());
    }
}
