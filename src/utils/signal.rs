// src/utils/signal.rs: Raw signal preprocessing ahead of decoding

pub const MAD_FACTOR: f32 = 1.4826;


fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}


/// Median and scaled median absolute deviation of a signal.
///
/// # Arguments
///
/// * `x` - Signal samples.
///
/// # Returns
/// (median, MAD * 1.4826); both 0 for an empty signal.
pub fn med_mad(x: &[f32]) -> (f32, f32) {
    let mut values = x.to_vec();
    let med = median(&mut values);
    let mut deviations: Vec<f32> = x.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&mut deviations) * MAD_FACTOR;
    (med, mad)
}


/// Centres the signal on its median and scales by the MAD.
/// A flat signal (MAD of 0) is only centred.
pub fn rescale_signal(x: &[i16]) -> Vec<f32> {
    let signal: Vec<f32> = x.iter().map(|&v| v as f32).collect();
    let (med, mad) = med_mad(&signal);
    let scale = if mad > 0.0 { mad } else { 1.0 };
    signal.into_iter().map(|v| (v - med) / scale).collect()
}


/// Last `chunk` samples of a signal.
pub fn tail(signal: &[i16], chunk: usize) -> &[i16] {
    &signal[signal.len().saturating_sub(chunk)..]
}


/// Finds where the open-pore stall at the start of a read ends.
///
/// The threshold is taken from the tail of the signal. The first window with more than
/// `min_elements` samples above it, and whose last sample is back under it, marks the end.
///
/// # Arguments
///
/// * `signal` - Raw samples.
/// * `window` - Window size in samples, 40 by default.
/// * `threshold_factor` - MADs above the median, 3.0 by default.
/// * `min_elements` - Samples above threshold needed to flag a window, 3 by default.
///
/// # Returns
/// Index of the first sample after the stall, or 0 if none was found.
pub fn trim_signal(signal: &[i16], window: usize, threshold_factor: f32, min_elements: usize) -> usize {
    if window == 0 {
        return 0;
    }
    let samples: Vec<f32> = signal.iter().map(|&v| v as f32).collect();
    let (med, mad) = med_mad(&samples[samples.len().saturating_sub(window * 25)..]);
    let threshold = med + mad * threshold_factor;

    for (pos, chunk) in samples.chunks_exact(window).enumerate() {
        let above = chunk.iter().filter(|&&v| v > threshold).count();
        if above > min_elements {
            if chunk[window - 1] > threshold {
                continue;
            }
            return (pos + 1) * window;
        }
    }
    0
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_med_mad() {
        let (med, mad) = med_mad(&[1.0, 2.0, 3.0, 4.0, 100.0]);
        assert_eq!(med, 3.0);
        // deviations 2,1,0,1,97 -> median 1
        assert!((mad - MAD_FACTOR).abs() < 1e-6);

        let (med, _) = med_mad(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(med, 2.5);
        assert_eq!(med_mad(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_rescale_signal() {
        let rescaled = rescale_signal(&[10, 20, 30, 40, 50]);
        // median 30, mad 10 * 1.4826
        assert!((rescaled[2]).abs() < 1e-6);
        assert!((rescaled[4] - 20.0 / (10.0 * MAD_FACTOR)).abs() < 1e-5);

        let flat = rescale_signal(&[7, 7, 7]);
        assert_eq!(flat, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_tail() {
        let signal: Vec<i16> = (0..10).collect();
        assert_eq!(tail(&signal, 4), &[6, 7, 8, 9]);
        assert_eq!(tail(&signal, 40).len(), 10);
    }

    #[test]
    fn test_trim_signal_finds_stall_end() {
        // a high stall of two windows followed by a long, noisy baseline
        let mut signal = vec![1000i16; 70];
        signal.extend(std::iter::repeat(100).take(10));
        for i in 0..2000 {
            signal.push(100 + (i % 7) as i16);
        }
        assert_eq!(trim_signal(&signal, 40, 3.0, 3), 80);
    }

    #[test]
    fn test_trim_signal_no_stall() {
        let signal: Vec<i16> = (0..2000).map(|i| 100 + (i % 5) as i16).collect();
        assert_eq!(trim_signal(&signal, 40, 3.0, 3), 0);
    }
}
