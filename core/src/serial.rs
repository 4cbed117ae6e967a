//! Serial stage: UART frames between serial bit chars and decoded bytes.
//!
//! The serial stream coming out of the carrier matcher may still be at any
//! baud tier, and recordings saved from a different machine often switch
//! tiers mid-stream. Before frame decoding, [`SerialStage::convert_baud_rate`]
//! normalizes the stream by hunting for the 0xFF lead-in frames every save
//! begins with: five agreeing lead-ins lock the tier, and every later bit is
//! subsampled down to one char per serial bit.
//!
//! Frame decoding itself is a little-endian UART: start bit 0, 7 or 8 data
//! bits, optional parity, 1 or 2 stop bits, all selected by the word-select
//! value (the same 3-bit encoding the original hardware's ACIA control
//! register used).

use crate::error::{Result, TapeError};
use crate::milestone::MilestoneLog;
use crate::pipeline::StageSignal;
use crate::sample::{Sample, SampleStream};
use crate::{BAUD_MIN_TO_TIER, BAUD_RATE, BAUD_TIER_TO_MIN, T9X_IDENTIFIER};

/// Reported frame error positions are capped; past this only a count is kept.
pub const MAX_FRAME_ERRORS: usize = 50;

struct ConvBaud {
    mag: usize,
    ptn: &'static [u8],
}

/// A 0xFF byte frame (start bit plus eight 1 bits) at each tier, slowest
/// first so the longest zero run is tried before its subsampled prefixes.
/// Stop bits are left off; they merge into the idle 1 run that follows.
const CONV_BAUD_TBL_FF: [ConvBaud; 4] = [
    ConvBaud {
        mag: 8,
        ptn: b"000000001111111111111111111111111111111111111111111111111111111111111111",
    },
    ConvBaud {
        mag: 4,
        ptn: b"000011111111111111111111111111111111",
    },
    ConvBaud {
        mag: 2,
        ptn: b"001111111111111111",
    },
    ConvBaud {
        mag: 1,
        ptn: b"011111111",
    },
];

const ZERO_RUN: &[u8] = b"00000000";

/// Data bits per frame for a word-select value.
pub(crate) fn data_bits(ws: u8) -> u8 {
    if ws & 0x04 != 0 {
        8
    } else {
        7
    }
}

/// Parity selection: -1 none, 0 even, 1 odd.
pub(crate) fn parity_select(ws: u8) -> i8 {
    if ws & 0x07 == 0x04 || ws & 0x07 == 0x05 {
        -1
    } else {
        (ws & 0x01) as i8
    }
}

pub(crate) fn stop_bits(ws: u8) -> u8 {
    if ws & 0x07 == 0x04 || ws & 0x06 == 0x00 {
        2
    } else {
        1
    }
}

/// Coalesced frame error positions for reporting.
#[derive(Debug, Default)]
pub struct FrameErrors {
    pub err_num: u32,
    pub over: bool,
    pub positions: Vec<i32>,
}

impl FrameErrors {
    pub fn clear(&mut self) {
        self.err_num = 0;
        self.over = false;
        self.positions.clear();
    }

    fn add(&mut self, spos: i32) {
        self.err_num += 1;
        if self.positions.len() < MAX_FRAME_ERRORS {
            self.positions.push(spos);
        } else {
            self.over = true;
        }
    }
}

pub struct SerialStage {
    auto_baud: bool,
    param_baud: i8,
    word_select: u8,
    use_sample_baud: bool,
    view_mode: bool,
    out_err_bytes: bool,

    // lead-in tracking for baud normalization
    phase_idx: i32,
    phase_cnt: usize,
    postfix: [Vec<Sample>; 6],
    locked_baud: i32,

    // uart frame state
    data_pos: i8,
    bit_len: u8,
    bit_parity: i8,
    bit_stop: u8,
    bin_data: u32,
    bin_err: u8,
    parity_count: u32,
    start_data: Sample,
    prev_err: Sample,
    frame_errors: FrameErrors,

    // l3b line-wrap state
    prev_data: u8,
    prev_width: i32,
    over_buf: Vec<u8>,

    // t9x bit packing
    t9x_byte: u8,
    t9x_bits: u8,
}

impl SerialStage {
    pub fn new() -> Self {
        SerialStage {
            auto_baud: true,
            param_baud: 0,
            word_select: 0x04,
            use_sample_baud: true,
            view_mode: false,
            out_err_bytes: false,
            phase_idx: -1,
            phase_cnt: 0,
            postfix: Default::default(),
            locked_baud: 0,
            data_pos: -1,
            bit_len: 0,
            bit_parity: -1,
            bit_stop: 1,
            bin_data: 0,
            bin_err: 0,
            parity_count: 0,
            start_data: Sample::default(),
            prev_err: Sample::default(),
            frame_errors: FrameErrors::default(),
            prev_data: 0,
            prev_width: 0,
            over_buf: Vec::new(),
            t9x_byte: 0,
            t9x_bits: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        baud: i8,
        auto_baud: bool,
        word_select: u8,
        use_sample_baud: bool,
        view_mode: bool,
        out_err_bytes: bool,
    ) {
        self.auto_baud = auto_baud;
        self.param_baud = baud;
        self.word_select = word_select;
        self.use_sample_baud = use_sample_baud;
        self.view_mode = view_mode;
        self.out_err_bytes = out_err_bytes;
        self.clear_baud_count();
        self.locked_baud = 0;
        self.data_pos = -1;
        self.start_data = Sample::default();
        self.prev_err = Sample::default();
        self.prev_data = 0;
        self.prev_width = 0;
        self.over_buf.clear();
        self.t9x_byte = 0;
        self.t9x_bits = 0;
    }

    pub fn clear_result(&mut self) {
        self.frame_errors.clear();
    }

    pub fn frame_errors(&self) -> &FrameErrors {
        &self.frame_errors
    }

    pub fn data_pos(&self) -> i8 {
        self.data_pos
    }

    /// Restore frame state from a milestone snapshot.
    pub fn restore(&mut self, data_pos: i8, baud: i8) {
        self.data_pos = data_pos;
        if baud >= 0 {
            self.locked_baud = baud as i32;
        }
    }

    pub fn locked_baud(&self) -> i32 {
        self.locked_baud
    }

    /// Serial-bit sample rate of an l3b or t9x stream.
    pub fn sample_rate(baud: usize, fsk_speed: usize) -> f64 {
        BAUD_RATE[baud & 3] as f64 * (fsk_speed + 1) as f64
    }

    fn clear_baud_count(&mut self) {
        self.phase_idx = -1;
        self.phase_cnt = 0;
        for buf in self.postfix.iter_mut() {
            buf.clear();
        }
    }

    /// Normalize the serial stream to one char per bit, detecting the baud
    /// tier from 0xFF lead-in frames when auto detection is on.
    pub fn convert_baud_rate(
        &mut self,
        s: &mut SampleStream,
        sn: &mut SampleStream,
    ) -> StageSignal {
        loop {
            if sn.is_full(131) {
                return StageSignal::OutputFull;
            }
            let s_last = s.is_last_data();
            if s_last && s.is_tail(0) {
                sn.set_last_data(true);
                return StageSignal::Complete;
            }
            if !s_last && s.is_tail(32) {
                return StageSignal::NeedMoreData;
            }

            if !self.auto_baud {
                let mut d = s.read();
                d.baud = self.param_baud;
                d.sn_sta = 1;
                sn.push(d);
                continue;
            }

            let mut idx = None;
            for (i, tbl) in CONV_BAUD_TBL_FF.iter().enumerate() {
                if s.compare_read(0, tbl.ptn) == 0 {
                    idx = Some(i);
                    break;
                }
            }
            match idx {
                Some(idx) => self.track_lead_in(s, sn, idx),
                None => self.step_locked_tier(s, sn),
            }
        }
    }

    /// A lead-in frame matched at tier table entry `idx`: buffer the frame
    /// up to the next inter-frame zero run, and lock the tier once five
    /// frames agree.
    fn track_lead_in(&mut self, s: &mut SampleStream, sn: &mut SampleStream, idx: usize) {
        let pos = CONV_BAUD_TBL_FF[idx].ptn.len();
        let mag = CONV_BAUD_TBL_FF[idx].mag;

        let o_idx = self.phase_idx;
        if o_idx >= 0 && o_idx != idx as i32 {
            let cnt = self.phase_cnt;
            self.out_baud_converted(sn, BAUD_MIN_TO_TIER[o_idx as usize] as i8, mag, cnt);
            self.clear_baud_count();
        }
        self.phase_idx = idx as i32;
        self.phase_cnt += 1;

        // frame span runs to the next start-bit zero run, so the stop and
        // idle bits travel with the frame and alignment is kept
        let mut flen = match s.find_read(pos + mag, &ZERO_RUN[..mag]) {
            Some(d) => (d + pos + mag).min(pos + mag * 4),
            None => pos,
        };
        if s.is_tail(flen) {
            flen = s.remain_len();
        }
        let frame: Vec<Sample> = (0..flen).map(|n| s.get_read(n)).collect();
        if self.phase_cnt <= self.postfix.len() {
            self.postfix[self.phase_cnt - 1] = frame;
        }
        s.add_read_pos(flen);

        if self.phase_cnt > 4 {
            self.locked_baud = BAUD_MIN_TO_TIER[idx] as i32;
            log::debug!("serial: baud tier {} locked", self.locked_baud);
            let cnt = self.phase_cnt;
            self.out_baud_converted(sn, self.locked_baud as i8, mag, cnt);
            self.clear_baud_count();
        }
    }

    /// No lead-in at the read cursor: flush anything buffered, then pass one
    /// bit through at the locked tier's magnification.
    fn step_locked_tier(&mut self, s: &mut SampleStream, sn: &mut SampleStream) {
        if self.phase_idx >= 0 {
            let idx = self.phase_idx as usize;
            let n_idx = if self.locked_baud == 3 {
                idx as i32 + 3
            } else {
                idx as i32 + 2 - self.locked_baud
            };
            if (0..4).contains(&n_idx) {
                let n_mag = CONV_BAUD_TBL_FF[idx].mag / CONV_BAUD_TBL_FF[n_idx as usize].mag;
                let cnt = self.phase_cnt;
                self.out_baud_converted(sn, self.locked_baud as i8, n_mag.max(1), cnt);
            }
            self.clear_baud_count();
        }

        let idx = BAUD_TIER_TO_MIN[self.locked_baud as usize];
        let cnt = 1usize << (3 - idx);
        if same_as_read(s, cnt) {
            let mut d = s.get_read(0);
            d.baud = self.locked_baud as i8;
            d.sn_sta = 1;
            sn.push(d);
            s.add_read_pos(cnt);
        } else {
            if self.view_mode {
                let mut d = s.get_read(0);
                d.data = b'?';
                d.err = 0x8;
                d.baud = self.locked_baud as i8;
                sn.push(d);
            }
            s.add_read_pos(1);
        }
    }

    /// Emit the buffered lead-in frames, one char per `mag` source chars.
    fn out_baud_converted(&mut self, sn: &mut SampleStream, baud: i8, mag: usize, cnt: usize) {
        let mag = mag.max(1);
        let mut first = true;
        for i in 0..cnt.min(self.postfix.len()) {
            let buf = std::mem::take(&mut self.postfix[i]);
            let mut j = 0;
            while j < buf.len() {
                let mut d = buf[j];
                d.baud = baud;
                d.sn_sta = if first { 1 } else { 0 };
                first = false;
                sn.push(d);
                j += mag;
            }
        }
    }

    /// One decode step: hunt for a start bit or advance within the frame.
    pub fn decode(
        &mut self,
        sn: &mut SampleStream,
        b_data: &mut SampleStream,
        milestones: &mut MilestoneLog,
    ) -> StageSignal {
        loop {
            if b_data.is_full(0) {
                return StageSignal::OutputFull;
            }
            let s_last = sn.is_last_data();
            if s_last && sn.is_tail(0) {
                b_data.set_last_data(true);
                return StageSignal::Complete;
            }
            if !s_last && sn.is_tail(32) {
                return StageSignal::NeedMoreData;
            }
            if self.data_pos < 0 {
                self.find_start_serial_bit(sn, b_data, milestones);
            } else {
                self.decode_to_binary(sn, b_data);
            }
        }
    }

    fn find_start_serial_bit(
        &mut self,
        sn: &mut SampleStream,
        b_data: &mut SampleStream,
        milestones: &mut MilestoneLog,
    ) {
        let d = sn.get_read(0);
        if d.data != b'?' && d.data & 0x01 == 0 {
            self.bit_len = data_bits(self.word_select);
            self.bit_parity = parity_select(self.word_select);
            self.bit_stop = stop_bits(self.word_select);
            self.start_data = d;
            self.data_pos = 0;
            if d.sn_sta != 0 {
                milestones.modify_mark_if_need(d.spos, d.baud, d.c_phase, d.c_frip, d.sn_sta, 0);
            }
            return;
        }
        if self.view_mode && d.data != b'?' {
            // idle bit, kept visible in the viewer
            let mut v = d;
            v.data = 0;
            v.err = 0x9;
            b_data.push(v);
        }
        sn.add_read_pos(1);
    }

    fn decode_to_binary(&mut self, sn: &mut SampleStream, b_data: &mut SampleStream) {
        let d = sn.get_read(0);
        if d.data == b'?' {
            sn.add_read_pos(1);
            return;
        }
        let bit = d.data & 0x01;
        let pos = self.data_pos as u32;
        let parity_pos = self.bit_len as u32 + 1;
        let stop1_pos = parity_pos + if self.bit_parity >= 0 { 1 } else { 0 };

        if pos == 0 {
            self.bin_data = 0;
            self.bin_err = 0;
            self.parity_count = 0;
            self.data_pos = 1;
        } else if pos <= self.bit_len as u32 {
            if bit != 0 {
                self.bin_data |= 1 << (pos - 1);
                self.parity_count += 1;
            }
            self.data_pos += 1;
        } else if self.bit_parity >= 0 && pos == parity_pos {
            let expect = if self.bit_parity == 1 {
                (self.parity_count & 1) as u8
            } else {
                1 - (self.parity_count & 1) as u8
            };
            if bit != expect {
                self.bin_err |= 0x0c;
            }
            self.data_pos += 1;
        } else if pos == stop1_pos {
            if bit == 0 {
                self.bin_err |= 0x0a;
            }
            if self.bit_stop == 2 && sn.get_read(1).data & 0x01 != 0 {
                self.data_pos += 1;
            } else {
                sn.add_read_pos(1);
                self.data_end(b_data);
                return;
            }
        } else {
            // second stop bit, nothing to verify
            sn.add_read_pos(1);
            self.data_end(b_data);
            return;
        }
        sn.add_read_pos(1);
    }

    fn data_end(&mut self, b_data: &mut SampleStream) {
        let baud = if self.use_sample_baud {
            if self.auto_baud {
                self.start_data.baud
            } else {
                self.param_baud
            }
        } else {
            0
        };
        let out = Sample {
            data: self.bin_data as u8,
            spos: self.start_data.spos,
            baud,
            err: self.bin_err,
            sn_sta: self.start_data.sn_sta,
            ..Default::default()
        };
        if self.bin_err == 0 {
            b_data.push(out);
            self.prev_err = Sample::default();
        } else {
            // a run of bad frames is reported once, at its first position
            if self.prev_err.spos == 0 {
                self.frame_errors.add(self.start_data.spos);
            }
            self.prev_err = self.start_data;
            self.prev_err.err = self.bin_err;
            log::trace!(
                "serial: frame error {:#x} at spos={}",
                self.bin_err,
                self.start_data.spos
            );
            if self.view_mode || self.out_err_bytes {
                b_data.push(out);
            }
        }
        self.data_pos = -1;
    }

    /// Frame one byte as serial bit chars. Returns the chars written.
    pub fn encode_to_serial(&mut self, data: u8, spos: i32, s_data: &mut SampleStream) -> usize {
        let ws = self.word_select;
        let mut buf: Vec<u8> = Vec::with_capacity(12);
        buf.push(b'0');
        let mut count = 0u32;
        for i in 0..data_bits(ws) {
            if data >> i & 1 != 0 {
                buf.push(b'1');
                count += 1;
            } else {
                buf.push(b'0');
            }
        }
        match parity_select(ws) {
            1 => buf.push(if count & 1 != 0 { b'1' } else { b'0' }),
            0 => buf.push(if count & 1 != 0 { b'0' } else { b'1' }),
            _ => {}
        }
        buf.push(b'1');
        if stop_bits(ws) == 2 {
            buf.push(b'1');
        }
        s_data.push_bytes(&buf, spos, -1, 0)
    }

    /// Append the window `[start_pos, write_pos)` of serial bit chars to an
    /// l3b text buffer, wrapping lines at `width` columns on a 1-to-0 edge.
    pub fn write_l3b_data(&mut self, out: &mut Vec<u8>, s_data: &mut SampleStream) -> usize {
        self.write_l3b_data_width(out, s_data, 110)
    }

    pub fn write_l3b_data_width(
        &mut self,
        out: &mut Vec<u8>,
        s_data: &mut SampleStream,
        width: i32,
    ) -> usize {
        let mut w = self.prev_width;
        let mut prev = self.prev_data;

        for l in s_data.start_pos()..s_data.write_pos() {
            let data = s_data.at(l).data;
            if w >= width && prev == b'1' && data == b'0' {
                out.extend_from_slice(&self.over_buf);
                out.extend_from_slice(b"\r\n");
                w = 0;
                self.over_buf.clear();
            }
            if w >= width * 2 {
                // no bit edge showed up, force the break
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
            prev = data;
        }
        if s_data.is_last_data() && !self.over_buf.is_empty() {
            out.extend_from_slice(&self.over_buf);
            self.over_buf.clear();
        }

        let len = s_data.len();
        let wp = s_data.write_pos();
        s_data.set_start_pos(wp);
        self.prev_data = prev;
        self.prev_width = w;
        len
    }

    /// Pack the window `[start_pos, write_pos)` of serial bit chars into t9x
    /// container bytes, least significant bit first.
    pub fn write_t9x_data(&mut self, out: &mut Vec<u8>, s_data: &mut SampleStream) -> usize {
        for l in s_data.start_pos()..s_data.write_pos() {
            if s_data.at(l).data & 0x01 != 0 {
                self.t9x_byte |= 1 << self.t9x_bits;
            }
            self.t9x_bits += 1;
            if self.t9x_bits >= 8 {
                out.push(self.t9x_byte);
                self.t9x_byte = 0;
                self.t9x_bits = 0;
            }
        }
        if s_data.is_last_data() && self.t9x_bits > 0 {
            out.push(self.t9x_byte);
            self.t9x_byte = 0;
            self.t9x_bits = 0;
        }

        let len = s_data.len();
        let wp = s_data.write_pos();
        s_data.set_start_pos(wp);
        len
    }
}

impl Default for SerialStage {
    fn default() -> Self {
        SerialStage::new()
    }
}

fn same_as_read(s: &SampleStream, cnt: usize) -> bool {
    if s.remain_len() < cnt {
        return false;
    }
    let d0 = s.get_read(0).data;
    (1..cnt).all(|n| s.get_read(n).data == d0)
}

/// Validate a t9x container header, returning its two data fields.
pub fn parse_t9x_header(header: &[u8; 64]) -> Result<(i32, i32)> {
    if &header[..32] != T9X_IDENTIFIER {
        return Err(TapeError::InvalidT9xHeader);
    }
    let data1 = i32::from_le_bytes([header[32], header[33], header[34], header[35]]);
    let data2 = i32::from_le_bytes([header[36], header[37], header[38], header[39]]);
    Ok((data1, data2))
}

pub fn build_t9x_header(data1: i32, data2: i32) -> [u8; 64] {
    let mut h = [0u8; 64];
    h[..32].copy_from_slice(T9X_IDENTIFIER);
    h[32..36].copy_from_slice(&data1.to_le_bytes());
    h[36..40].copy_from_slice(&data2.to_le_bytes());
    h
}

/// Expand t9x container bytes to serial bit chars, least significant bit
/// first. Source positions count up from `spos` per bit.
pub fn read_t9x_data(bytes: &[u8], spos: i32, s_data: &mut SampleStream) -> usize {
    let mut n = 0;
    for &b in bytes {
        for i in 0..8 {
            if s_data.is_full(0) {
                return n;
            }
            let ch = if b >> i & 1 != 0 { b'1' } else { b'0' };
            s_data.push(Sample::new(ch, spos + n as i32));
            n += 1;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(bits: &str, spos: i32) -> SampleStream {
        let mut s = SampleStream::new(crate::DATA_ARRAY_SIZE);
        s.push_bytes(bits.as_bytes(), spos, -1, 0);
        s.set_last_data(true);
        s
    }

    fn decode_all(stage: &mut SerialStage, sn: &mut SampleStream) -> SampleStream {
        let mut b = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let mut ms = MilestoneLog::new();
        ms.clear(crate::DATA_ARRAY_SIZE as i32 / 2);
        loop {
            match stage.decode(sn, &mut b, &mut ms) {
                StageSignal::Continue => {}
                _ => break,
            }
        }
        b
    }

    #[test]
    fn test_encode_frame_length_per_word_select() {
        // (word select, expected frame length)
        for (ws, frame_len) in [(0x04u8, 11), (0x00, 11), (0x05, 10), (0x01, 11), (0x06, 11)] {
            let mut stage = SerialStage::new();
            stage.init(0, true, ws, true, false, false);
            let mut s = SampleStream::new(64);
            let n = stage.encode_to_serial(0x55, 0, &mut s);
            assert_eq!(n, frame_len, "word select {:#x}", ws);
            assert_eq!(s.at(0).data, b'0');
        }
    }

    #[test]
    fn test_encode_decode_round_trip_8n2() {
        let mut stage = SerialStage::new();
        stage.init(1, true, 0x04, true, false, false);
        let mut sn = SampleStream::new(crate::DATA_ARRAY_SIZE);
        sn.push_bytes(b"11", 0, -1, 0);
        for (i, &byte) in [0xa5u8, 0x00, 0xff, 0x3c].iter().enumerate() {
            stage.encode_to_serial(byte, (i as i32 + 1) * 100, &mut sn);
        }
        sn.push_bytes(b"1111", 900, -1, 0);
        sn.set_last_data(true);

        let b = decode_all(&mut stage, &mut sn);
        assert_eq!(b.write_pos(), 4);
        assert_eq!(b.at(0).data, 0xa5);
        assert_eq!(b.at(0).spos, 100);
        assert_eq!(b.at(1).data, 0x00);
        assert_eq!(b.at(2).data, 0xff);
        assert_eq!(b.at(3).data, 0x3c);
        assert_eq!(stage.frame_errors().err_num, 0);
    }

    #[test]
    fn test_decode_parity_error_drops_byte() {
        // 7 data bits, odd parity, 2 stop bits
        let mut stage = SerialStage::new();
        stage.init(1, true, 0x01, true, false, false);
        let mut sn = SampleStream::new(crate::DATA_ARRAY_SIZE);
        stage.encode_to_serial(0x41, 100, &mut sn);
        // flip the parity bit (position 8 of the frame)
        let mut bad = sn.at(8);
        bad.data = if bad.data == b'1' { b'0' } else { b'1' };
        sn.set_at(8, bad);
        sn.push_bytes(b"1111", 200, -1, 0);
        sn.set_last_data(true);

        let b = decode_all(&mut stage, &mut sn);
        assert_eq!(b.write_pos(), 0);
        assert_eq!(stage.frame_errors().err_num, 1);
        assert_eq!(stage.frame_errors().positions, vec![100]);
    }

    #[test]
    fn test_decode_stop_bit_error() {
        let mut stage = SerialStage::new();
        stage.init(1, true, 0x04, true, false, false);
        // start, 8 zero data bits, then a 0 where stop 1 belongs
        let mut sn = stream_of("1100000000001111", 50);
        let b = decode_all(&mut stage, &mut sn);
        assert_eq!(b.write_pos(), 0);
        assert_eq!(stage.frame_errors().err_num, 1);
    }

    #[test]
    fn test_frame_error_runs_coalesce() {
        let mut stage = SerialStage::new();
        stage.init(1, true, 0x01, true, false, false);
        let mut sn = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let bad_frame = |sn: &mut SampleStream, spos: i32| {
            let base = sn.write_pos();
            let mut st = SerialStage::new();
            st.init(0, true, 0x01, true, false, false);
            st.encode_to_serial(0x41, spos, sn);
            let mut p = sn.at(base + 8);
            p.data = if p.data == b'1' { b'0' } else { b'1' };
            sn.set_at(base + 8, p);
        };
        bad_frame(&mut sn, 100);
        bad_frame(&mut sn, 200);
        {
            let mut st = SerialStage::new();
            st.init(0, true, 0x01, true, false, false);
            st.encode_to_serial(0x42, 300, &mut sn);
        }
        bad_frame(&mut sn, 400);
        sn.push_bytes(b"1111", 500, -1, 0);
        sn.set_last_data(true);

        let b = decode_all(&mut stage, &mut sn);
        // back-to-back bad frames report once, the run after the good
        // frame reports again
        assert_eq!(stage.frame_errors().err_num, 2);
        assert_eq!(stage.frame_errors().positions, vec![100, 400]);
        assert_eq!(b.write_pos(), 1);
        assert_eq!(b.at(0).data, 0x42);
    }

    #[test]
    fn test_view_mode_emits_errored_bytes() {
        let mut stage = SerialStage::new();
        stage.init(1, true, 0x04, true, true, false);
        let mut sn = stream_of("1100000000001111", 50);
        let b = decode_all(&mut stage, &mut sn);
        let frames: Vec<Sample> = (0..b.write_pos())
            .map(|i| b.at(i))
            .filter(|s| s.err & 0x02 != 0)
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, 0x00);
    }

    #[test]
    fn test_convert_baud_rate_locks_after_five_lead_ins() {
        let mut stage = SerialStage::new();
        stage.init(0, true, 0x04, true, false, false);
        // 0xFF frames at the 1200 tier: every serial bit spans two chars
        let mut frame = String::from("00");
        for _ in 0..16 {
            frame.push('1');
        }
        frame.push_str("1111"); // two stop bits
        let mut s = stream_of(&frame.repeat(5), 0);
        let mut sn = SampleStream::new(crate::DATA_ARRAY_SIZE);

        let sig = stage.convert_baud_rate(&mut s, &mut sn);
        assert_eq!(sig, StageSignal::Complete);
        assert_eq!(stage.locked_baud(), 1);
        // 4 aligned frames of 11 bits, a tail frame of 9, then 2 idle bits
        assert_eq!(sn.write_pos(), 55);
        assert_eq!(sn.string_of(0, 11), "01111111111");
        assert_eq!(sn.at(0).sn_sta, 1);
        assert_eq!(sn.at(0).baud, 1);
        assert_eq!(sn.at(1).sn_sta, 0);
        assert!(sn.is_last_data());
    }

    #[test]
    fn test_convert_baud_rate_pass_through() {
        let mut stage = SerialStage::new();
        stage.init(2, false, 0x04, true, false, false);
        let mut s = stream_of("01101", 10);
        let mut sn = SampleStream::new(crate::DATA_ARRAY_SIZE);
        let sig = stage.convert_baud_rate(&mut s, &mut sn);
        assert_eq!(sig, StageSignal::Complete);
        assert_eq!(sn.write_pos(), 5);
        assert_eq!(sn.string_of(0, 5), "01101");
        assert_eq!(sn.at(0).baud, 2);
        assert_eq!(sn.at(4).sn_sta, 1);
    }

    #[test]
    fn test_l3b_wrap_on_bit_edge() {
        let mut stage = SerialStage::new();
        stage.init(0, true, 0x04, true, false, false);
        let mut s = SampleStream::new(1024);
        s.push_bytes("10".repeat(17).as_bytes(), 0, -1, 0);
        s.push_bytes(b"1", 0, -1, 0);
        s.set_last_data(true);
        let mut out = Vec::new();
        stage.write_l3b_data_width(&mut out, &mut s, 10);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= 20, "line too long: {}", line.len());
        }
        assert_eq!(lines.concat().len(), 35);
    }

    #[test]
    fn test_t9x_pack_and_expand() {
        let mut stage = SerialStage::new();
        stage.init(0, true, 0x04, true, false, false);
        let mut s = stream_of("0110100110", 0);
        let mut out = Vec::new();
        stage.write_t9x_data(&mut out, &mut s);
        // lsb first: 01101001 -> 0x96, tail 10 -> 0x01
        assert_eq!(out, vec![0x96, 0x01]);

        let mut back = SampleStream::new(64);
        read_t9x_data(&[0x96], 0, &mut back);
        assert_eq!(back.string_of(0, 8), "01101001");
    }

    #[test]
    fn test_t9x_header_round_trip() {
        let h = build_t9x_header(0, 9);
        let (d1, d2) = parse_t9x_header(&h).unwrap();
        assert_eq!((d1, d2), (0, 9));

        let mut bad = h;
        bad[0] = b'x';
        assert!(parse_t9x_header(&bad).is_err());
    }
}
