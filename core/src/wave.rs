//! FSK audio stage: zero-cross demodulation of wave samples to carrier bit
//! chars, and tone synthesis back to wave samples.
//!
//! The demodulator measures the time between zero crossings (interpolating
//! the crossing instant between samples) and classifies each wavelength
//! against acceptance windows around the two FSK tones. A low tone period
//! emits `1100`, a high tone period emits `10`; wavelengths between or
//! outside the windows emit the same shapes flagged as errors, so later
//! stages can still resynchronize on damaged audio. Half-wave mode measures
//! every crossing instead of every other one, which doubles the timing
//! resolution on asymmetric recordings.

use crate::milestone::MilestoneLog;
use crate::pipeline::StageSignal;
use crate::sample::SampleStream;

/// Carrier chars the encoder emits per bit char, standard FSK.
const ENC_SAMPLES_STD: usize = 10;
/// Flat level of the synthesized square-ish wave.
const ENC_LEVEL: i32 = 0x70;
/// Softened level at a tone transition.
const ENC_LEVEL_EDGE: i32 = 0x6c;

/// Wavelength classification windows derived from the sample rate.
///
/// Index 0..2 covers 1200/2400/4800 Hz; double-speed FSK uses indices 1..2.
/// All `us_*` values are microseconds, halved in half-wave mode.
#[derive(Debug, Clone)]
pub struct LambdaTable {
    pub us_delta: f64,
    pub samples: [f64; 3],
    pub us_range: [f64; 3],
    pub us: [f64; 3],
    pub us_avg: [f64; 3],
    pub us_min: [f64; 3],
    pub us_max: [f64; 3],
    pub us_mid: [f64; 2],
    pub us_mid_avg: [f64; 2],
    pub us_limit: [f64; 2],
}

impl LambdaTable {
    pub fn new() -> Self {
        LambdaTable {
            us_delta: 0.0,
            samples: [0.0; 3],
            us_range: [0.0; 3],
            us: [0.0; 3],
            us_avg: [0.0; 3],
            us_min: [0.0; 3],
            us_max: [0.0; 3],
            us_mid: [0.0; 2],
            us_mid_avg: [0.0; 2],
            us_limit: [0.0; 2],
        }
    }

    /// Build the windows for `rate`.
    ///
    /// `ranges` are tolerance percentages for the long and short tone; in
    /// analyze mode a fixed asymmetric window (-25%, +50%) is used instead
    /// so the tallies stay comparable between runs.
    pub fn init(
        &mut self,
        rate: f64,
        freq: &[u32; 3],
        half_wave: bool,
        fsk_speed: usize,
        ranges: [u32; 2],
        analyzing: bool,
    ) {
        let div = if half_wave { 2.0 } else { 1.0 };
        self.us_delta = 1_000_000.0 / rate;
        for n in 0..3 {
            self.samples[n] = rate / f64::from(1200 << n);
            self.us_range[n] = 1_000_000.0 / f64::from(1200 << n) / div;
            self.us[n] = 1_000_000.0 / f64::from(freq[n]) / div;
            self.us_avg[n] = self.us[n];
        }
        for n in 0..2 {
            self.us_mid[n] = 1_000_000.0 / f64::from(1800 << n) / div;
            self.us_mid_avg[n] = self.us_mid[n];
            self.us_limit[n] = 1_000_000.0 / f64::from(1200 << (n + 3));
        }
        for (n, ns) in (fsk_speed..fsk_speed + 2).enumerate() {
            if analyzing {
                self.us_min[ns] = self.us[ns] - self.us_range[ns] * 0.25;
                self.us_max[ns] = self.us[ns] + self.us_range[ns] * 0.50;
            } else {
                self.us_min[ns] = self.us[ns] - self.us_range[ns] * ranges[n] as f64 / 100.0;
                self.us_max[ns] = self.us[ns] + self.us_range[ns] * ranges[n] as f64 / 100.0;
            }
        }
    }
}

impl Default for LambdaTable {
    fn default() -> Self {
        LambdaTable::new()
    }
}

/// Zero-cross tracker state carried between decode calls.
#[derive(Debug, Clone, Copy)]
struct CrossState {
    x0_prev: f64,
    sample_cnt: i32,
    wav_prev: i32,
    carr_prev: i32,
    odd: u8,
}

impl CrossState {
    fn clear() -> Self {
        CrossState {
            x0_prev: 0.0,
            sample_cnt: 0,
            wav_prev: 0,
            carr_prev: 0,
            odd: 0,
        }
    }
}

/// Wavelength tally indices: long, short, middle, too long, too short,
/// error.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveStats {
    pub sample_num: [u32; 6],
}

impl WaveStats {
    pub fn clear(&mut self) {
        self.sample_num = [0; 6];
    }
}

pub struct WaveStage {
    lamda: LambdaTable,
    cross: CrossState,
    prev_cross_spos: i32,
    half_wave: bool,
    fsk_speed: usize,
    stats: WaveStats,
}

impl WaveStage {
    pub fn new() -> Self {
        WaveStage {
            lamda: LambdaTable::new(),
            cross: CrossState::clear(),
            prev_cross_spos: 0,
            half_wave: false,
            fsk_speed: 0,
            stats: WaveStats::default(),
        }
    }

    pub fn init_for_decode(
        &mut self,
        rate: f64,
        freq: &[u32; 3],
        half_wave: bool,
        fsk_speed: usize,
        ranges: [u32; 2],
        analyzing: bool,
    ) {
        self.cross = CrossState::clear();
        self.prev_cross_spos = 0;
        self.half_wave = half_wave;
        self.fsk_speed = fsk_speed;
        self.lamda.init(rate, freq, half_wave, fsk_speed, ranges, analyzing);
    }

    pub fn lamda(&self) -> &LambdaTable {
        &self.lamda
    }

    pub fn stats(&self) -> &WaveStats {
        &self.stats
    }

    pub fn clear_result(&mut self) {
        self.stats.clear();
    }

    pub fn set_prev_cross(&mut self, spos: i32) {
        self.prev_cross_spos = spos;
    }

    /// Classify the next wavelength of `w_data` and append its carrier
    /// chars to `c_data`.
    pub fn decode_to_carrier(
        &mut self,
        w_data: &mut SampleStream,
        c_data: &mut SampleStream,
        milestones: &mut MilestoneLog,
    ) -> StageSignal {
        let spd = self.fsk_speed;
        let mut found = false;
        let mut hi = false;
        let mut lamda = 0.0f64;
        let mut data = 0i32;
        let mut cross_spos = 0i32;

        // find the next trigger point
        while !w_data.is_tail(0) {
            let sample = w_data.read();
            data = sample.data as i32 - 128;
            cross_spos = sample.spos;

            let rising = self.cross.wav_prev < 0 && data >= 0;
            let falling = self.cross.wav_prev > 0 && data <= 0 && self.half_wave;
            if rising || falling {
                hi = rising;
                let x0 = -(self.cross.wav_prev as f64 * self.lamda.us_delta
                    / (data - self.cross.wav_prev) as f64);
                lamda = self.cross.x0_prev
                    + self.cross.sample_cnt as f64 * self.lamda.us_delta
                    + x0;
                // too short to be signal, treat as noise inside the wave
                if lamda >= self.lamda.us_limit[spd] {
                    self.cross.x0_prev = self.lamda.us_delta - x0;
                    self.cross.odd = 1 - self.cross.odd;
                    found = true;
                    break;
                }
            }
            self.cross.sample_cnt += 1;
            self.cross.wav_prev = data;
        }
        if !found {
            return if w_data.is_last_data() {
                StageSignal::Complete
            } else {
                StageSignal::NeedMoreData
            };
        }

        let bits: &[u8] = if !self.half_wave {
            self.classify_full_wave(lamda)
        } else {
            self.classify_half_wave(lamda, hi)
        };

        milestones.modify_mark_if_need(self.prev_cross_spos, -1, 0, 0, 0, -1);

        if bits[0] != b'?' {
            c_data.push_bytes(bits, self.prev_cross_spos, -1, 0);
        } else {
            c_data.push_bytes(&bits[1..], self.prev_cross_spos, -1, 0x8);
        }
        log::trace!(
            "wave: spos={} lamda={:.3}us -> {}",
            self.prev_cross_spos,
            lamda,
            String::from_utf8_lossy(bits)
        );

        self.cross.wav_prev = data;
        self.cross.sample_cnt = 0;
        self.prev_cross_spos = cross_spos;

        if c_data.is_full(4) {
            StageSignal::OutputFull
        } else if !w_data.is_last_data()
            && w_data.is_tail(self.lamda.samples[1] as usize + 2)
        {
            StageSignal::NeedMoreData
        } else {
            StageSignal::Continue
        }
    }

    fn classify_full_wave(&mut self, lamda: f64) -> &'static [u8] {
        let spd = self.fsk_speed;
        let l = &mut self.lamda;
        if l.us_min[spd] <= lamda && lamda <= l.us_max[spd] {
            self.cross.carr_prev = 4;
            l.us_avg[spd] = (l.us_avg[spd] + lamda) / 2.0;
            self.stats.sample_num[0] += 1;
            b"1100"
        } else if l.us_min[spd + 1] <= lamda && lamda <= l.us_max[spd + 1] {
            self.cross.carr_prev = 2;
            l.us_avg[spd + 1] = (l.us_avg[spd + 1] + lamda) / 2.0;
            self.stats.sample_num[1] += 1;
            b"10"
        } else if l.us_mid[spd] <= lamda && lamda < l.us_min[spd] {
            // long side of the dead zone
            self.cross.carr_prev = 4;
            l.us_mid_avg[spd] = (l.us_mid_avg[spd] + lamda) / 2.0;
            self.stats.sample_num[2] += 1;
            b"?1100"
        } else if l.us_max[spd + 1] < lamda && lamda < l.us_mid[spd] {
            // short side of the dead zone
            self.cross.carr_prev = 2;
            l.us_mid_avg[spd] = (l.us_mid_avg[spd] + lamda) / 2.0;
            self.stats.sample_num[2] += 1;
            b"?10"
        } else if l.us_max[spd] < lamda {
            self.cross.carr_prev = 5;
            self.stats.sample_num[3] += 1;
            b"?GGLL"
        } else if lamda < l.us_min[spd + 1] {
            self.cross.carr_prev = 1;
            self.stats.sample_num[4] += 1;
            b"?GL"
        } else {
            self.cross.carr_prev = 0;
            self.stats.sample_num[5] += 1;
            b"??"
        }
    }

    fn classify_half_wave(&mut self, lamda: f64, hi: bool) -> &'static [u8] {
        let spd = self.fsk_speed;
        let l = &mut self.lamda;
        let cp = self.cross.carr_prev;
        if l.us_min[spd] <= lamda && lamda <= l.us_max[spd] {
            l.us_avg[spd] = (l.us_avg[spd] + lamda) / 2.0;
            self.stats.sample_num[0] += 1;
            if hi {
                if cp != 4 {
                    self.cross.odd = 1;
                }
                self.cross.carr_prev = -4;
                b"00"
            } else {
                if cp != -4 {
                    self.cross.odd = 1;
                }
                self.cross.carr_prev = 4;
                b"11"
            }
        } else if l.us_min[spd + 1] <= lamda && lamda <= l.us_max[spd + 1] {
            l.us_avg[spd + 1] = (l.us_avg[spd + 1] + lamda) / 2.0;
            self.stats.sample_num[1] += 1;
            if hi {
                if cp != 2 {
                    self.cross.odd = 1;
                }
                self.cross.carr_prev = -2;
                b"0"
            } else {
                if cp != -2 {
                    self.cross.odd = 1;
                }
                self.cross.carr_prev = 2;
                b"1"
            }
        } else if l.us_max[spd + 1] < lamda && lamda < l.us_min[spd] {
            l.us_mid_avg[spd] = (l.us_mid_avg[spd] + lamda) / 2.0;
            self.stats.sample_num[2] += 1;
            let odd = self.cross.odd;
            if hi {
                if (odd == 0 && cp == 4) || (odd == 1 && cp == 2) {
                    self.cross.carr_prev = -4;
                    b"?00"
                } else {
                    self.cross.carr_prev = -2;
                    b"?0"
                }
            } else if (odd == 0 && cp == -4) || (odd == 1 && cp == -2) {
                self.cross.carr_prev = 4;
                b"?11"
            } else {
                self.cross.carr_prev = 2;
                b"?1"
            }
        } else if l.us_max[spd] < lamda {
            self.stats.sample_num[3] += 1;
            if hi {
                self.cross.carr_prev = -5;
                b"?LL"
            } else {
                self.cross.carr_prev = 5;
                b"?GG"
            }
        } else if lamda < l.us_min[spd + 1] {
            self.stats.sample_num[4] += 1;
            if hi {
                self.cross.carr_prev = -1;
                b"?L"
            } else {
                self.cross.carr_prev = 1;
                b"?G"
            }
        } else {
            self.cross.carr_prev = 0;
            self.stats.sample_num[5] += 1;
            b"??"
        }
    }

    /// Synthesize the next carrier char of `c_data` as wave samples
    /// (centered 8-bit at a 48000 Hz equivalent rate) and append them to
    /// `out`. Returns the sample count emitted.
    pub fn encode_to_wave(&self, c_data: &mut SampleStream, out: &mut Vec<u8>) -> usize {
        let last = if self.fsk_speed != 0 {
            ENC_SAMPLES_STD / 2
        } else {
            ENC_SAMPLES_STD
        };

        let r = c_data.read_pos();
        let cur = c_data.at(r).data & 1;
        let mut levels = [ENC_LEVEL; ENC_SAMPLES_STD];
        // soften the edge samples where the polarity changes
        if r == 0 || (c_data.at(r - 1).data & 1) != cur {
            levels[0] = ENC_LEVEL_EDGE;
        }
        if last > 0 && (r + 1 >= c_data.write_pos() || cur != (c_data.at(r + 1).data & 1)) {
            levels[last - 1] = ENC_LEVEL_EDGE;
        }

        for &lv in levels.iter().take(last) {
            let v = if cur != 0 { lv } else { -lv };
            out.push((0x80 + v) as u8);
        }
        c_data.read();
        last
    }
}

impl Default for WaveStage {
    fn default() -> Self {
        WaveStage::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;
    use std::f64::consts::PI;

    const RATE: f64 = 22050.0;
    const FREQ: [u32; 3] = [1200, 2400, 4800];

    fn sine_samples(freq: f64, cycles: usize) -> SampleStream {
        let mut w = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let n = (RATE * cycles as f64 / freq) as usize;
        for i in 0..n {
            let v = (2.0 * PI * freq * i as f64 / RATE).sin();
            w.push(Sample::new((v * 100.0 + 128.0) as u8, i as i32));
        }
        w.set_last_data(true);
        w
    }

    fn decode_all(stage: &mut WaveStage, w: &mut SampleStream) -> String {
        let mut c = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let mut ms = MilestoneLog::new();
        ms.clear(crate::DATA_ARRAY_SIZE as i32 / 2);
        loop {
            match stage.decode_to_carrier(w, &mut c, &mut ms) {
                StageSignal::Continue => {}
                _ => break,
            }
        }
        c.string_of(0, c.write_pos())
    }

    #[test]
    fn test_full_wave_low_tone_classifies_long() {
        let mut stage = WaveStage::new();
        stage.init_for_decode(RATE, &FREQ, false, 0, [25, 50], false);
        let mut w = sine_samples(1200.0, 20);
        let bits = decode_all(&mut stage, &mut w);
        assert!(bits.contains("110011001100"), "bits = {}", bits);
        assert!(stage.stats().sample_num[0] >= 18);
        assert_eq!(stage.stats().sample_num[5], 0);
    }

    #[test]
    fn test_full_wave_high_tone_classifies_short() {
        let mut stage = WaveStage::new();
        stage.init_for_decode(RATE, &FREQ, false, 0, [25, 50], false);
        let mut w = sine_samples(2400.0, 40);
        let bits = decode_all(&mut stage, &mut w);
        assert!(bits.contains("101010"), "bits = {}", bits);
        assert!(stage.stats().sample_num[1] >= 38);
    }

    #[test]
    fn test_half_wave_emits_polarity_runs() {
        let mut stage = WaveStage::new();
        stage.init_for_decode(RATE, &FREQ, true, 0, [25, 50], false);
        let mut w = sine_samples(1200.0, 20);
        let bits = decode_all(&mut stage, &mut w);
        assert!(bits.contains("0011"), "bits = {}", bits);
    }

    #[test]
    fn test_too_long_wavelength_flags_error() {
        let mut stage = WaveStage::new();
        stage.init_for_decode(RATE, &FREQ, false, 0, [25, 50], false);
        // 400 Hz is far below the long-tone window
        let mut w = sine_samples(400.0, 10);
        let mut c = SampleStream::new(4096);
        let mut ms = MilestoneLog::new();
        ms.clear(2048);
        loop {
            match stage.decode_to_carrier(&mut w, &mut c, &mut ms) {
                StageSignal::Continue => {}
                _ => break,
            }
        }
        assert!(stage.stats().sample_num[3] >= 8);
        // too-long shapes are emitted with the error flag set
        let errs = (0..c.write_pos()).filter(|&i| c.at(i).err & 0x8 != 0).count();
        assert!(errs > 0);
        assert!(c.string_of(0, c.write_pos()).contains("GGLL"));
    }

    #[test]
    fn test_needs_more_data_without_last_flag() {
        let mut stage = WaveStage::new();
        stage.init_for_decode(RATE, &FREQ, false, 0, [25, 50], false);
        let mut w = sine_samples(1200.0, 2);
        w.set_last_data(false);
        let mut c = SampleStream::new(4096);
        let mut ms = MilestoneLog::new();
        ms.clear(2048);
        let mut sig = StageSignal::Continue;
        for _ in 0..100 {
            sig = stage.decode_to_carrier(&mut w, &mut c, &mut ms);
            if sig != StageSignal::Continue {
                break;
            }
        }
        assert_eq!(sig, StageSignal::NeedMoreData);
    }

    #[test]
    fn test_encode_one_bit_char_sample_count() {
        let stage = WaveStage::new();
        let mut c = SampleStream::new(64);
        c.push_bytes(b"10", 0, -1, 0);
        let mut out = Vec::new();
        assert_eq!(stage.encode_to_wave(&mut c, &mut out), 10);
        assert_eq!(stage.encode_to_wave(&mut c, &mut out), 10);
        assert_eq!(out.len(), 20);
        // first half above center, second half below
        assert!(out[4] > 0x80);
        assert!(out[14] < 0x80);
    }

    #[test]
    fn test_encode_softens_transitions() {
        let stage = WaveStage::new();
        let mut c = SampleStream::new(64);
        c.push_bytes(b"110", 0, -1, 0);
        let mut out = Vec::new();
        stage.encode_to_wave(&mut c, &mut out);
        stage.encode_to_wave(&mut c, &mut out);
        stage.encode_to_wave(&mut c, &mut out);
        // edges at the run boundaries use the softened level
        assert_eq!(out[0], 0x80 + ENC_LEVEL_EDGE as u8);
        assert_eq!(out[1], 0x80 + ENC_LEVEL as u8);
        assert_eq!(out[19], 0x80 + ENC_LEVEL_EDGE as u8);
        assert_eq!(out[20], (0x80 - ENC_LEVEL_EDGE) as u8);
    }
}
