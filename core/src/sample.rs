//! Sample records and the fixed-capacity stream buffer shared by every
//! pipeline stage.
//!
//! A `Sample` carries one unit of whichever representation a stage works on
//! (an audio level, a carrier/serial bit char, or a decoded byte) together
//! with the source audio position it was derived from, so errors found late
//! in the pipeline can still be reported as times in the original recording.

use crate::DATA_ARRAY_SIZE;

/// One element of a [`SampleStream`].
///
/// `spos` is the position in the source audio this value traces back to.
/// `baud` is the detected tier index (-1 while unknown). `err` is a 4-bit
/// flag set (0x8 wave/carrier shape error, 0x4 parity, 0x2 stop bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub data: u8,
    pub spos: i32,
    pub baud: i8,
    pub err: u8,
    pub c_phase: u8,
    pub c_frip: u8,
    pub sn_sta: u8,
    pub user: u8,
}

impl Sample {
    pub fn new(data: u8, spos: i32) -> Self {
        Sample {
            data,
            spos,
            ..Default::default()
        }
    }
}

impl Default for Sample {
    fn default() -> Self {
        Sample {
            data: 0,
            spos: 0,
            baud: -1,
            err: 0,
            c_phase: 0,
            c_frip: 0,
            sn_sta: 0,
            user: 0,
        }
    }
}

/// Fixed-capacity stream of samples with independent write, read and start
/// cursors plus lifetime totals.
///
/// The buffer never reallocates; writes past capacity are silently dropped
/// and the producer is expected to check [`SampleStream::is_full`] first.
/// [`SampleStream::shift`] discards consumed elements by moving the live
/// region to the front, which keeps cursor values small across arbitrarily
/// long inputs.
pub struct SampleStream {
    datas: Vec<Sample>,
    size: usize,
    rate: f64,
    w_pos: usize,
    r_pos: usize,
    start_pos: usize,
    total_w_pos: i64,
    total_r_pos: i64,
    last_data: bool,
}

impl SampleStream {
    pub fn new(size: usize) -> Self {
        SampleStream {
            datas: vec![Sample::default(); size],
            size,
            rate: 0.0,
            w_pos: 0,
            r_pos: 0,
            start_pos: 0,
            total_w_pos: 0,
            total_r_pos: 0,
            last_data: false,
        }
    }

    /// Reset every cursor and total; capacity and rate are kept.
    pub fn clear(&mut self) {
        for d in self.datas.iter_mut() {
            *d = Sample::default();
        }
        self.w_pos = 0;
        self.r_pos = 0;
        self.start_pos = 0;
        self.total_w_pos = 0;
        self.total_r_pos = 0;
        self.last_data = false;
    }

    pub fn at(&self, pos: usize) -> Sample {
        if pos < self.w_pos {
            self.datas[pos]
        } else {
            Sample::default()
        }
    }

    /// Peek relative to the read cursor without consuming.
    pub fn get_read(&self, offset: usize) -> Sample {
        self.at(self.r_pos + offset)
    }

    pub fn set_at(&mut self, pos: usize, val: Sample) {
        if pos < self.size {
            self.datas[pos] = val;
        }
    }

    /// Unread element count.
    pub fn len(&self) -> usize {
        self.w_pos - self.r_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_len(&self) -> usize {
        self.size - self.w_pos
    }

    /// Append one sample. Dropped without error when the buffer is full.
    pub fn push(&mut self, val: Sample) {
        if self.w_pos < self.size {
            self.datas[self.w_pos] = val;
            self.w_pos += 1;
            self.total_w_pos += 1;
        }
    }

    /// Append a run of data bytes sharing position and flags. Returns the
    /// count actually stored.
    pub fn push_bytes(&mut self, bytes: &[u8], spos: i32, baud: i8, err: u8) -> usize {
        let mut n = 0;
        for &b in bytes {
            if self.w_pos >= self.size {
                break;
            }
            self.push(Sample {
                data: b,
                spos,
                baud,
                err,
                ..Default::default()
            });
            n += 1;
        }
        n
    }

    /// Append `len` copies of one data byte.
    pub fn repeat(&mut self, data: u8, len: usize, spos: i32, baud: i8, err: u8) -> usize {
        let mut n = 0;
        for _ in 0..len {
            if self.w_pos >= self.size {
                break;
            }
            self.push(Sample {
                data,
                spos,
                baud,
                err,
                ..Default::default()
            });
            n += 1;
        }
        n
    }

    /// Consume and return the sample under the read cursor.
    pub fn read(&mut self) -> Sample {
        let s = self.at(self.r_pos);
        if self.r_pos < self.w_pos {
            self.r_pos += 1;
            self.total_r_pos += 1;
        }
        s
    }

    pub fn is_full(&self, offset: usize) -> bool {
        self.w_pos + offset >= self.size
    }

    pub fn is_tail(&self, offset: usize) -> bool {
        self.r_pos + offset >= self.w_pos
    }

    /// Unread count measured from the read cursor.
    pub fn remain_len(&self) -> usize {
        self.w_pos - self.r_pos
    }

    pub fn is_last_data(&self) -> bool {
        self.last_data
    }

    pub fn set_last_data(&mut self, val: bool) {
        self.last_data = val;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, val: f64) {
        self.rate = val;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn start_pos(&self) -> usize {
        self.start_pos
    }

    pub fn set_start_pos(&mut self, pos: usize) {
        self.start_pos = pos;
    }

    pub fn read_pos(&self) -> usize {
        self.r_pos
    }

    pub fn write_pos(&self) -> usize {
        self.w_pos
    }

    pub fn total_read_pos(&self) -> i64 {
        self.total_r_pos
    }

    pub fn total_write_pos(&self) -> i64 {
        self.total_w_pos
    }

    pub fn add_read_pos(&mut self, num: usize) -> usize {
        let num = num.min(self.w_pos - self.r_pos);
        self.r_pos += num;
        self.total_r_pos += num as i64;
        self.r_pos
    }

    /// Reposition the read cursor, keeping the lifetime total in step with
    /// the distance moved. Used to re-decode a window that was probed.
    pub fn set_read_pos(&mut self, pos: usize) {
        let pos = pos.min(self.w_pos);
        self.total_r_pos += pos as i64 - self.r_pos as i64;
        self.r_pos = pos;
    }

    /// Move the read cursor to the write cursor, dropping unread samples.
    pub fn skip_to_tail(&mut self) {
        let num = self.w_pos - self.r_pos;
        self.r_pos = self.w_pos;
        self.total_r_pos += num as i64;
    }

    /// Discard everything before the read cursor.
    pub fn shift(&mut self) {
        self.shift_at(self.r_pos);
    }

    /// Discard the first `offset` elements, moving the live region to the
    /// front and rebasing all three cursors (clamped at 0).
    pub fn shift_at(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        let tail = self.w_pos.saturating_sub(offset);
        for i in 0..tail {
            self.datas[i] = self.datas[i + offset];
        }
        self.w_pos = tail;
        self.r_pos = self.r_pos.saturating_sub(offset);
        self.start_pos = self.start_pos.saturating_sub(offset);
    }

    /// Undo the current round: lifetime totals forget the buffered samples
    /// and both cursors return to 0. Used by backward scrubbing.
    pub fn revert(&mut self) {
        self.total_w_pos = (self.total_w_pos - self.w_pos as i64).max(0);
        self.total_r_pos = (self.total_r_pos - self.r_pos as i64).max(0);
        self.w_pos = 0;
        self.r_pos = 0;
    }

    /// Byte-wise compare of the stream data at `offset` against a pattern.
    /// Running past the write cursor compares greater.
    pub fn compare(&self, offset: usize, ptn: &[u8]) -> i32 {
        if offset + ptn.len() > self.w_pos {
            return 1;
        }
        for (n, &p) in ptn.iter().enumerate() {
            let cmp = p as i32 - self.datas[offset + n].data as i32;
            if cmp != 0 {
                return cmp.signum();
            }
        }
        0
    }

    pub fn compare_read(&self, offset: usize, ptn: &[u8]) -> i32 {
        self.compare(self.r_pos + offset, ptn)
    }

    /// First match of `ptn` at or after `offset`, as a distance from
    /// `offset`.
    pub fn find(&self, offset: usize, ptn: &[u8]) -> Option<usize> {
        if ptn.len() > self.w_pos {
            return None;
        }
        let tail = self.w_pos - ptn.len();
        (offset..=tail).find(|&pos| self.compare(pos, ptn) == 0).map(|pos| pos - offset)
    }

    pub fn find_read(&self, offset: usize, ptn: &[u8]) -> Option<usize> {
        self.find(self.r_pos + offset, ptn)
    }

    /// First index at or after `offset` whose source position reaches `spos`.
    pub fn find_spos(&self, offset: usize, spos: i32) -> Option<usize> {
        (offset..self.w_pos).find(|&i| spos <= self.datas[i].spos)
    }

    /// Last index whose run of source positions still precedes `spos`,
    /// scanning backwards from the write cursor.
    pub fn find_rev_spos(&self, offset: usize, spos: i32) -> Option<usize> {
        for i in (offset..self.w_pos).rev() {
            if spos > self.datas[i].spos {
                return Some((i + 1).min(self.w_pos - 1));
            }
        }
        if self.w_pos > offset + 1 && spos == self.datas[offset].spos {
            return Some(offset);
        }
        None
    }

    /// Gather a data range as an ASCII string (used by the bit-char tiers).
    pub fn string_of(&self, offset: usize, len: usize) -> String {
        let end = (offset + len).min(self.w_pos);
        (offset..end).map(|i| self.datas[i].data as char).collect()
    }

    /// Gather a data range as raw bytes.
    pub fn bytes_of(&self, offset: usize, len: usize) -> Vec<u8> {
        let end = (offset + len).min(self.w_pos);
        self.datas[offset..end].iter().map(|s| s.data).collect()
    }
}

impl Default for SampleStream {
    fn default() -> Self {
        SampleStream::new(DATA_ARRAY_SIZE)
    }
}
