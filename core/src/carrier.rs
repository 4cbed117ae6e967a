//! Carrier stage: pattern matching between carrier bit chars and serial
//! bits.
//!
//! A serial 0 is carried as one low-tone period and a serial 1 as two
//! high-tone periods, repeated per baud tier (a 600 baud bit spans twice
//! the chars of a 1200 baud bit, and so on). Recordings can be inverted
//! end to end, so every pattern exists in a flipped variant and the
//! matcher tracks which orientation the stream is in. At 2400 baud a bit
//! is a single period and the orientation alternates on every 0, which is
//! why that tier gets special handling throughout.

use crate::milestone::MilestoneLog;
use crate::pipeline::{ChkWave, StageSignal};
use crate::sample::{Sample, SampleStream};

/// Pattern tier indices: 0=600, 1=1200, 2=2400, 3=300 baud.
pub const IDX_PTN_600: usize = 0;
pub const IDX_PTN_1200: usize = 1;
pub const IDX_PTN_2400: usize = 2;
pub const IDX_PTN_300: usize = 3;

/// Per tier: serial 0 normal, 0 flipped, 1 normal, 1 flipped.
const CARRIER_PATTERN: [[&[u8]; 4]; 4] = [
    [b"11001100", b"00110011", b"10101010", b"01010101"],
    [b"1100", b"0011", b"1010", b"0101"],
    [b"11", b"00", b"10", b"01"],
    [
        b"1100110011001100",
        b"0011001100110011",
        b"1010101010101010",
        b"0101010101010101",
    ],
];

/// At 2400 baud an edge between bits pins the orientation, so these are
/// searched before the plain patterns. Each match yields two serial bits.
const CARRIER_EDGE_PATTERN: [&[u8]; 4] = [b"0010", b"1101", b"0100", b"1011"];

/// Matcher position within the bit stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CarrierPhase {
    /// Hunting for the first recognizable pattern.
    FindStart,
    /// Locked, matching bits at the current orientation.
    Matching,
}

pub struct CarrierStage {
    phase: CarrierPhase,
    frip: u8,
    baud24_frip: usize,
    baud: usize,
    error_num: u32,
    // l3c line-wrap state
    prev_data: u32,
    prev_width: i32,
    over_buf: Vec<u8>,
}

impl CarrierStage {
    pub fn new() -> Self {
        CarrierStage {
            phase: CarrierPhase::FindStart,
            frip: 0,
            baud24_frip: 0,
            baud: 0,
            error_num: 0,
            prev_data: 0,
            prev_width: 0,
            over_buf: Vec::new(),
        }
    }

    pub fn init(&mut self, baud: usize) {
        self.phase = CarrierPhase::FindStart;
        self.frip = 0;
        self.baud24_frip = 0;
        self.baud = baud;
        self.prev_data = 0;
        self.prev_width = 0;
        self.over_buf.clear();
    }

    pub fn clear_result(&mut self) {
        self.error_num = 0;
    }

    pub fn error_num(&self) -> u32 {
        self.error_num
    }

    /// Carrier-equivalent sample rate of an l3c stream.
    pub fn sample_rate(fsk_speed: usize) -> f64 {
        4800.0 * (fsk_speed + 1) as f64
    }

    pub fn phase_index(&self) -> u8 {
        match self.phase {
            CarrierPhase::FindStart => 0,
            CarrierPhase::Matching => 1,
        }
    }

    pub fn frip(&self) -> u8 {
        self.frip
    }

    /// Restore matcher state from a milestone snapshot.
    pub fn restore(&mut self, phase: u8, frip: u8) {
        self.phase = if phase == 0 {
            CarrierPhase::FindStart
        } else {
            CarrierPhase::Matching
        };
        self.frip = frip;
    }

    /// One decode step: hunt for the start pattern or match the next bit.
    pub fn decode(
        &mut self,
        c_data: &mut SampleStream,
        s_data: &mut SampleStream,
        baud: usize,
        milestones: &mut MilestoneLog,
    ) -> StageSignal {
        match self.phase {
            CarrierPhase::FindStart => {
                let (sig, found) = self.find_start_carrier_bit(c_data, s_data, baud, milestones);
                if found {
                    self.phase = CarrierPhase::Matching;
                }
                sig
            }
            CarrierPhase::Matching => {
                let (sig, matched) = self.decode_to_serial(c_data, s_data, baud, milestones);
                if !matched {
                    self.phase = CarrierPhase::FindStart;
                }
                sig
            }
        }
    }

    /// Scan for the earliest match of any orientation and emit its serial
    /// bit(s). Returns the signal and whether a start was found.
    fn find_start_carrier_bit(
        &mut self,
        c_data: &mut SampleStream,
        s_data: &mut SampleStream,
        baud: usize,
        milestones: &mut MilestoneLog,
    ) -> (StageSignal, bool) {
        let idx_ptn = baud & 3;
        let mut best_num: Option<usize> = None;
        let mut best_pos = c_data.size();
        let mut consumed = None;
        let mut out: Vec<Sample> = Vec::with_capacity(2);

        // at 2400 baud a bit edge pins the orientation, find it first
        if idx_ptn == IDX_PTN_2400 {
            for (i, ptn) in CARRIER_EDGE_PATTERN.iter().enumerate() {
                if let Some(p) = c_data.find_read(0, ptn) {
                    if p < best_pos {
                        best_pos = p;
                        best_num = Some(i);
                    }
                }
            }
            if let Some(num) = best_num {
                consumed = Some(best_pos + CARRIER_EDGE_PATTERN[num].len());
                for n in 0..2 {
                    let mut s = c_data.get_read(best_pos + n * 2);
                    s.baud = baud as i8;
                    s.c_phase = self.phase_index();
                    s.c_frip = self.frip;
                    out.push(s);
                }
                if num / 2 == 0 {
                    out[0].data = b'0';
                    out[1].data = b'1';
                } else {
                    out[0].data = b'1';
                    out[1].data = b'0';
                }
                milestones.modify_mark_if_need(
                    out[0].spos,
                    baud as i8,
                    self.phase_index(),
                    self.frip,
                    0,
                    -1,
                );
                self.frip = (num % 2) as u8;
            }
        }

        if best_num.is_none() {
            for (i, ptn) in CARRIER_PATTERN[idx_ptn].iter().enumerate() {
                if let Some(p) = c_data.find_read(0, ptn) {
                    if p < best_pos {
                        best_pos = p;
                        best_num = Some(i);
                    }
                }
            }
            if let Some(num) = best_num {
                consumed = Some(best_pos + CARRIER_PATTERN[idx_ptn][num].len());
                let mut s = c_data.get_read(best_pos);
                s.baud = baud as i8;
                s.c_phase = self.phase_index();
                s.c_frip = self.frip;
                s.data = if num / 2 == 0 { b'0' } else { b'1' };
                out.push(s);
                milestones.modify_mark_if_need(
                    s.spos,
                    baud as i8,
                    self.phase_index(),
                    self.frip,
                    0,
                    -1,
                );
                self.frip = (num % 2) as u8;
            }
        }

        let found = consumed.is_some();
        if let Some(pos) = consumed {
            log::debug!(
                "carrier: start at spos={} frip={}",
                out[0].spos,
                self.frip
            );
            for s in out {
                s_data.push(s);
            }
            c_data.add_read_pos(pos);
        } else {
            c_data.skip_to_tail();
        }

        let c_last = c_data.is_last_data() && c_data.is_tail(0);
        s_data.set_last_data(c_last);

        let sig = if c_last {
            StageSignal::Complete
        } else if found {
            if c_data.is_tail(32) {
                StageSignal::NeedMoreData
            } else {
                StageSignal::Continue
            }
        } else {
            StageSignal::NeedMoreData
        };
        (sig, found)
    }

    /// Match the next serial bit at the locked orientation. Returns the
    /// signal and whether the patterns still match.
    fn decode_to_serial(
        &mut self,
        c_data: &mut SampleStream,
        s_data: &mut SampleStream,
        baud: usize,
        milestones: &mut MilestoneLog,
    ) -> (StageSignal, bool) {
        let idx_ptn = baud & 3;
        let frip = self.frip as usize;

        let mut sample = c_data.get_read(0);
        sample.baud = baud as i8;
        sample.c_phase = self.phase_index();
        sample.c_frip = self.frip;

        let mut pos = None;
        let ptn = CARRIER_PATTERN[idx_ptn][frip];
        if c_data.compare_read(0, ptn) == 0 {
            sample.data = b'0';
            pos = Some(ptn.len());
            if idx_ptn == IDX_PTN_2400 {
                // a 0 at 2400 baud always flips the orientation
                self.frip = 1 - self.frip;
            }
        }
        if pos.is_none() && idx_ptn == IDX_PTN_2400 {
            // flipped retry of the 0 pattern
            let ptn = CARRIER_PATTERN[idx_ptn][1 - frip];
            if c_data.compare_read(0, ptn) == 0 {
                sample.data = b'0';
                pos = Some(ptn.len());
                self.frip = 1 - self.frip;
            }
        }
        if pos.is_none() {
            let ptn = CARRIER_PATTERN[idx_ptn][2 + self.frip as usize];
            if c_data.compare_read(0, ptn) == 0 {
                sample.data = b'1';
                pos = Some(ptn.len());
            }
        }

        let matched = pos.is_some();
        if let Some(len) = pos {
            s_data.push(sample);
            c_data.add_read_pos(len);
            milestones.modify_mark_if_need(
                sample.spos,
                sample.baud,
                sample.c_phase,
                sample.c_frip,
                0,
                -1,
            );
        } else {
            sample.data = b'?';
            sample.err = 0x8;
            s_data.push(sample);
            if c_data.remain_len() > 0 {
                c_data.add_read_pos(1);
            }
            self.error_num += 1;
        }

        let c_last = c_data.is_last_data() && c_data.is_tail(0);
        s_data.set_last_data(c_last);

        let sig = if c_last {
            StageSignal::Complete
        } else if s_data.is_full(0) {
            StageSignal::OutputFull
        } else if c_data.is_tail(32) {
            StageSignal::NeedMoreData
        } else {
            StageSignal::Continue
        };
        (sig, matched)
    }

    /// Probe the stream for each baud tier's lead-in (idle 1s, a start 0,
    /// eight more 1s), slowest tier first, tallying which tier and which
    /// orientation match. Used by the analyzer.
    pub fn parse_baud_rate(
        &mut self,
        c_data: &mut SampleStream,
        chkwav: &mut ChkWave,
        cor: usize,
    ) -> StageSignal {
        let mut found_len = 0usize;
        let mut pos0 = None;
        let mut pos1 = None;

        for idx in 0..4 {
            let idx_ptn = crate::BAUD_MIN_TO_TIER[idx];
            let ptn = &CARRIER_PATTERN[idx_ptn];
            // 1-run, one 0 bit, then eight 1 bits
            let idx_frip = if idx_ptn == IDX_PTN_2400 { 3 } else { 2 };
            let mut buf0: Vec<u8> = Vec::new();
            let mut buf1: Vec<u8> = Vec::new();
            buf0.extend_from_slice(ptn[2]);
            buf1.extend_from_slice(ptn[3]);
            buf0.extend_from_slice(ptn[0]);
            buf1.extend_from_slice(ptn[1]);
            for _ in 0..8 {
                buf0.extend_from_slice(ptn[idx_frip]);
                buf1.extend_from_slice(ptn[5 - idx_frip]);
            }
            pos0 = c_data.find_read(0, &buf0);
            pos1 = c_data.find_read(0, &buf1);
            if pos0.is_some() {
                chkwav.rev_num[cor][0] += 1;
            }
            if pos1.is_some() {
                chkwav.rev_num[cor][1] += 1;
            }
            if pos0.is_some() || pos1.is_some() {
                found_len = buf0.len();
                chkwav.baud_num[cor][idx_ptn] += 1;
                break;
            }
        }

        let pos = match (pos0, pos1) {
            (Some(p0), Some(p1)) => Some(p0.max(p1) + found_len),
            (Some(p0), None) => Some(p0 + found_len),
            (None, Some(p1)) => Some(p1 + found_len),
            (None, None) => None,
        };

        match pos {
            Some(step) => {
                c_data.add_read_pos(step);
                if c_data.is_last_data() && c_data.is_tail(0) {
                    StageSignal::Complete
                } else if c_data.is_tail(32) {
                    StageSignal::NeedMoreData
                } else {
                    StageSignal::Continue
                }
            }
            None => {
                if c_data.is_last_data() {
                    StageSignal::Complete
                } else {
                    StageSignal::NeedMoreData
                }
            }
        }
    }

    /// Expand one serial bit to its carrier pattern.
    pub fn encode_to_carrier(
        &mut self,
        s_data: &mut SampleStream,
        c_data: &mut SampleStream,
    ) -> usize {
        let idx_ptn = self.baud & 3;
        let sample = s_data.read();
        let ptn = if sample.data & 0x01 != 0 {
            CARRIER_PATTERN[idx_ptn][2 + self.baud24_frip]
        } else {
            let p = CARRIER_PATTERN[idx_ptn][self.baud24_frip];
            if idx_ptn == IDX_PTN_2400 {
                self.baud24_frip = 1 - self.baud24_frip;
            }
            p
        };
        c_data.push_bytes(ptn, sample.spos, -1, 0)
    }

    /// Append the window `[start_pos, write_pos)` of carrier chars to an
    /// l3c text buffer, wrapping lines at `width` columns. Wraps prefer a
    /// pattern boundary; a line that grows to twice the width is broken
    /// unconditionally.
    pub fn write_l3c_data(&mut self, out: &mut Vec<u8>, c_data: &mut SampleStream) -> usize {
        self.write_l3c_data_width(out, c_data, 80)
    }

    pub fn write_l3c_data_width(
        &mut self,
        out: &mut Vec<u8>,
        c_data: &mut SampleStream,
        width: i32,
    ) -> usize {
        let mut w = self.prev_width;
        let mut prev = self.prev_data & 0xffffff;

        for l in c_data.start_pos()..c_data.write_pos() {
            let data = c_data.at(l).data;
            if w >= width
                && (((prev & 0x010101) == 0x010001 && (data & 0x01) == 0x01)
                    || ((prev & 0x010101) == 0x000100 && (data & 0x01) == 0x00))
            {
                // break just before the previous char
                out.extend_from_slice(&self.over_buf);
                let kept = out.pop();
                out.extend_from_slice(b"\r\n");
                if let Some(k) = kept {
                    out.push(k);
                }
                w = 0;
                self.over_buf.clear();
            }
            if w >= width * 2 + 8 || (w >= width * 2 && ((prev ^ data as u32) & 0x01) == 0x01) {
                // no natural boundary showed up, force the break
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&self.over_buf);
                w -= width;
                self.over_buf.clear();
            }
            if w >= width {
                self.over_buf.push(data);
            } else {
                out.push(data);
            }
            w += 1;

            prev = (prev << 8) | data as u32;
        }
        if c_data.is_last_data() && !self.over_buf.is_empty() {
            out.extend_from_slice(&self.over_buf);
            self.over_buf.clear();
        }

        let len = c_data.len();
        let wp = c_data.write_pos();
        c_data.set_start_pos(wp);

        self.prev_data = prev & 0xffffff;
        self.prev_width = w;
        len
    }
}

impl Default for CarrierStage {
    fn default() -> Self {
        CarrierStage::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrier_of(bits: &str) -> SampleStream {
        let mut c = SampleStream::new(crate::DATA_ARRAY_SIZE);
        c.push_bytes(bits.as_bytes(), 0, -1, 0);
        c.set_last_data(true);
        c
    }

    fn decode_all(stage: &mut CarrierStage, c: &mut SampleStream, baud: usize) -> String {
        let mut s = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let mut ms = MilestoneLog::new();
        ms.clear(crate::DATA_ARRAY_SIZE as i32 / 2);
        loop {
            match stage.decode(c, &mut s, baud, &mut ms) {
                StageSignal::Continue => {}
                StageSignal::NeedMoreData if !c.is_tail(0) => {}
                _ => break,
            }
        }
        s.string_of(0, s.write_pos())
    }

    #[test]
    fn test_decode_1200_baud_bits() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_1200);
        let mut c = carrier_of("110011001010101011001100");
        let bits = decode_all(&mut stage, &mut c, IDX_PTN_1200);
        assert_eq!(bits, "001100");
    }

    #[test]
    fn test_decode_flipped_stream() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_1200);
        let mut c = carrier_of("001100110101010100110011");
        let bits = decode_all(&mut stage, &mut c, IDX_PTN_1200);
        assert_eq!(bits, "001100");
    }

    #[test]
    fn test_decode_600_baud_bits() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_600);
        let mut c = carrier_of("110011001010101010101010");
        let bits = decode_all(&mut stage, &mut c, IDX_PTN_600);
        assert_eq!(bits, "011");
    }

    #[test]
    fn test_decode_2400_baud_flips_on_zero() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_2400);
        // edge 0100 pins the start, then alternating-polarity 0 bits
        let mut c = carrier_of("01001100");
        let bits = decode_all(&mut stage, &mut c, IDX_PTN_2400);
        assert!(bits.starts_with("10"), "bits = {}", bits);
    }

    #[test]
    fn test_mismatch_emits_error_bit() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_1200);
        // lock on a 0 bit, then garbage the matcher cannot place
        let mut c = carrier_of("110011111100");
        let mut s = SampleStream::new(256);
        let mut ms = MilestoneLog::new();
        ms.clear(128);
        loop {
            match stage.decode(&mut c, &mut s, IDX_PTN_1200, &mut ms) {
                StageSignal::Continue => {}
                _ => break,
            }
        }
        let bits = s.string_of(0, s.write_pos());
        assert!(bits.contains('?'), "bits = {}", bits);
        assert!(stage.error_num() > 0);
        let errs = (0..s.write_pos()).filter(|&i| s.at(i).err & 0x8 != 0).count();
        assert!(errs > 0);
    }

    #[test]
    fn test_encode_round_trip_1200() {
        let mut enc = CarrierStage::new();
        enc.init(IDX_PTN_1200);
        let mut s = SampleStream::new(256);
        s.push_bytes(b"0110", 0, -1, 0);
        let mut c = SampleStream::new(256);
        for _ in 0..4 {
            enc.encode_to_carrier(&mut s, &mut c);
        }
        assert_eq!(c.string_of(0, c.write_pos()), "1100101010101100");
    }

    #[test]
    fn test_encode_2400_alternates_zero_polarity() {
        let mut enc = CarrierStage::new();
        enc.init(IDX_PTN_2400);
        let mut s = SampleStream::new(256);
        s.push_bytes(b"000", 0, -1, 0);
        let mut c = SampleStream::new(256);
        for _ in 0..3 {
            enc.encode_to_carrier(&mut s, &mut c);
        }
        assert_eq!(c.string_of(0, c.write_pos()), "110011");
    }

    #[test]
    fn test_parse_baud_rate_detects_1200() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_1200);
        // idle 1, one 0, eight 1 bits at the 1200 baud tier
        let mut bits = String::from("10101100");
        for _ in 0..8 {
            bits.push_str("1010");
        }
        let mut c = carrier_of(&bits);
        let mut chk = ChkWave::new();
        stage.parse_baud_rate(&mut c, &mut chk, 0);
        assert_eq!(chk.baud_num[0][IDX_PTN_1200], 1);
        assert_eq!(chk.rev_num[0][0], 1);
        assert_eq!(chk.rev_num[0][1], 0);
    }

    #[test]
    fn test_l3c_wrap_at_pattern_boundary() {
        let mut stage = CarrierStage::new();
        stage.init(IDX_PTN_1200);
        let mut c = SampleStream::new(8192);
        for _ in 0..40 {
            c.push_bytes(b"110010", 0, -1, 0);
        }
        c.set_last_data(true);
        let mut out = Vec::new();
        stage.write_l3c_data(&mut out, &mut c);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= 96, "line too long: {}", line.len());
        }
        let total: String = lines.concat();
        assert_eq!(total.len(), 240);
        assert!(total.chars().all(|ch| ch == '0' || ch == '1'));
    }
}
