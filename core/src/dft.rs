//! Single-bin correlation filter used to clean a noisy recording before
//! zero-cross detection.
//!
//! The filter slides a window of one low-tone period over the incoming
//! audio and correlates it with templates at the low tone and its second
//! harmonic (the high tone). Summing the two reconstructed components
//! suppresses broadband noise and DC wander while keeping both FSK tones,
//! which is what the zero-cross classifier needs. Template phase is
//! selectable (cosine or sine) because which one works better depends on
//! the recorder's phase response.

use std::f64::consts::PI;

use crate::sample::{Sample, SampleStream};

/// Maximum correlation window, bounding the supported rate/tone ratio.
pub const MAX_WINDOW: usize = 100;

/// Template phase selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionType {
    /// No correction, audio passes straight to the classifier.
    None,
    Cosine,
    Sine,
}

impl CorrectionType {
    pub fn from_index(idx: i32) -> Self {
        match idx {
            1 => CorrectionType::Cosine,
            2 => CorrectionType::Sine,
            _ => CorrectionType::None,
        }
    }

    pub fn index(self) -> i32 {
        match self {
            CorrectionType::None => 0,
            CorrectionType::Cosine => 1,
            CorrectionType::Sine => 2,
        }
    }
}

/// Sliding two-tone correlator. Feed it the raw wave stream one push at a
/// time; it appends corrected samples to the output stream with a lag of
/// one window.
pub struct WaveformCorrector {
    window: usize,
    h: [[f64; MAX_WINDOW]; 2],
    a_max: i32,
    a_min: i32,
}

impl WaveformCorrector {
    pub fn new() -> Self {
        WaveformCorrector {
            window: 0,
            h: [[0.0; MAX_WINDOW]; 2],
            a_max: 0,
            a_min: 0,
        }
    }

    /// Build the template tables.
    ///
    /// `samples_per_wave` is the low-tone period in samples at the input
    /// rate. `amp0`/`amp1` are per-tone gains in thousandths (1000 = unity).
    pub fn init(&mut self, samples_per_wave: f64, ctype: CorrectionType, amp0: i32, amp1: i32) {
        let n = (samples_per_wave.round() as usize).clamp(2, MAX_WINDOW);
        self.window = n;
        self.a_max = 0;
        self.a_min = 0;
        let gain = [
            2.0 * amp0 as f64 / 1000.0 / n as f64,
            2.0 * amp1 as f64 / 1000.0 / n as f64,
        ];
        for i in 0..n {
            let t0 = 2.0 * PI * i as f64 / n as f64;
            let (v0, v1) = match ctype {
                CorrectionType::Sine => ((t0).sin(), (2.0 * t0).sin()),
                _ => ((t0).cos(), (2.0 * t0).cos()),
            };
            self.h[0][i] = v0 * gain[0];
            self.h[1][i] = v1 * gain[1];
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn amp_max(&self) -> i32 {
        self.a_max
    }

    pub fn amp_min(&self) -> i32 {
        self.a_min
    }

    /// Correlate the newest window of `w_data` and append one corrected
    /// sample to `wc_data`. Call after every sample pushed to `w_data`;
    /// nothing is emitted until a full window has accumulated.
    pub fn calcrate(&mut self, w_data: &SampleStream, wc_data: &mut SampleStream) {
        let n = self.window;
        let w_pos = w_data.write_pos();
        if n == 0 || w_pos < n {
            return;
        }
        let base = w_pos - n;
        let mut acc = [0.0f64; 2];
        for i in 0..n {
            let centered = w_data.at(base + i).data as f64 - 128.0;
            acc[0] += centered * self.h[0][i];
            acc[1] += centered * self.h[1][i];
        }
        let v = acc[0] + acc[1];
        let vi = v.round() as i32;
        if vi > self.a_max {
            self.a_max = vi;
        }
        if vi < self.a_min {
            self.a_min = vi;
        }
        let out = (vi.clamp(-128, 127) + 128) as u8;
        // centered on the window so downstream positions stay aligned
        let spos = w_data.at(base + n / 2).spos;
        wc_data.push(Sample::new(out, spos));
    }
}

impl Default for WaveformCorrector {
    fn default() -> Self {
        WaveformCorrector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_tone(corr: &mut WaveformCorrector, freq: f64, rate: f64, n: usize) -> SampleStream {
        let mut w = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let mut wc = SampleStream::new(crate::DATA_ARRAY_SIZE);
        for i in 0..n {
            let v = (2.0 * PI * freq * i as f64 / rate).sin();
            w.push(Sample::new((v * 100.0 + 128.0) as u8, i as i32));
            corr.calcrate(&w, &mut wc);
        }
        wc
    }

    #[test]
    fn test_output_lags_by_one_window() {
        let mut corr = WaveformCorrector::new();
        corr.init(22050.0 / 1200.0, CorrectionType::Sine, 1000, 1000);
        let wc = feed_tone(&mut corr, 1200.0, 22050.0, 40);
        assert_eq!(wc.write_pos(), 40 - corr.window() + 1);
    }

    #[test]
    fn test_low_tone_passes_through_with_amplitude() {
        let mut corr = WaveformCorrector::new();
        corr.init(22050.0 / 1200.0, CorrectionType::Sine, 1000, 1000);
        let _ = feed_tone(&mut corr, 1200.0, 22050.0, 2000);
        // a 1200 Hz tone of amplitude 100 must survive correction
        assert!(corr.amp_max() > 50, "amp_max = {}", corr.amp_max());
        assert!(corr.amp_min() < -50, "amp_min = {}", corr.amp_min());
    }

    #[test]
    fn test_dc_offset_is_rejected() {
        let mut corr = WaveformCorrector::new();
        corr.init(22050.0 / 1200.0, CorrectionType::Sine, 1000, 1000);
        let mut w = SampleStream::new(4096);
        let mut wc = SampleStream::new(4096);
        for i in 0..500 {
            w.push(Sample::new(228, i));
            corr.calcrate(&w, &mut wc);
        }
        // templates sum to zero over a period, so a constant input nulls out
        assert!(corr.amp_max() <= 2, "amp_max = {}", corr.amp_max());
        assert!(corr.amp_min() >= -2, "amp_min = {}", corr.amp_min());
    }

    #[test]
    fn test_no_output_before_init() {
        let mut corr = WaveformCorrector::new();
        let mut w = SampleStream::new(64);
        let mut wc = SampleStream::new(64);
        w.push(Sample::new(128, 0));
        corr.calcrate(&w, &mut wc);
        assert_eq!(wc.write_pos(), 0);
    }
}
