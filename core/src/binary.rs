//! Binary stage: tape section structure between decoded bytes and the real
//! save payload.
//!
//! A save on tape is a name section (20-byte internal name plus format
//! flags), a run of body sections carrying up to 255 payload bytes each, and
//! a footer. Every section starts with the ident 0xFF 0x01 0x3C, a type
//! byte, a length byte and ends with a modulo-256 checksum folding the type,
//! the length and the payload. Body payloads are emitted one section late so
//! the machine-code loader's 5-byte header and trailer can be stripped once
//! the surrounding sections are known.

use crate::pipeline::StageSignal;
use crate::sample::SampleStream;

/// Section ident bytes; the trailing 0x00 doubles as the name type byte.
const SECTION_IDENT: [u8; 4] = [0xff, 0x01, 0x3c, 0x00];

const TYPE_NAME: u8 = 0x00;
const TYPE_BODY: u8 = 0x01;
const TYPE_FOOTER: u8 = 0xff;

/// Lead gap lengths in 0xFF bytes, by baud tier adjusted for double-speed.
const GAP_LENGTH: [usize; 4] = [0x5a, 0xc0, 0x19b, 0x36f];

/// Per-save decode results: which sections showed up, the internal name,
/// and any checksum mismatches as source position intervals.
#[derive(Debug, Clone)]
pub struct SectionRecord {
    pub name: [u8; 21],
    pub flags: u8,
    pub baud: i8,
    pub data_count: i32,
    pub chksum_errors: Vec<(i32, i32)>,
}

pub const FLAG_NAME: u8 = 1;
pub const FLAG_BODY: u8 = 2;
pub const FLAG_FOOTER: u8 = 4;

impl SectionRecord {
    fn new() -> Self {
        SectionRecord {
            name: [0; 21],
            flags: 0,
            baud: 0,
            data_count: 0,
            chksum_errors: Vec::new(),
        }
    }

    /// File format from the name section: 0 BASIC, 1 data, 2 machine code.
    pub fn data_format(&self) -> u8 {
        self.name[8]
    }

    /// Save mode from the name section: 0 binary, 0xff ascii.
    pub fn save_mode(&self) -> u8 {
        self.name[9]
    }
}

/// Parser position within the section stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionPhase {
    FindHeader,
    NameSection,
    BodySection,
    FooterSection,
}

pub struct BinarySectionStage {
    phase: SectionPhase,
    save_data_name: [u8; 21],
    strip_machine_header: bool,
    // body payloads are held back one section
    prev_data: Vec<u8>,
    records: Vec<SectionRecord>,
    open_record: Option<usize>,
}

impl BinarySectionStage {
    pub fn new() -> Self {
        BinarySectionStage {
            phase: SectionPhase::FindHeader,
            save_data_name: [0; 21],
            strip_machine_header: false,
            prev_data: Vec::new(),
            records: Vec::new(),
            open_record: None,
        }
    }

    pub fn init_for_decode(&mut self, strip_machine_header: bool) {
        self.phase = SectionPhase::FindHeader;
        self.save_data_name = [0; 21];
        // unknown until a name section arrives
        self.save_data_name[8] = 0x7f;
        self.save_data_name[9] = 0x7f;
        self.strip_machine_header = strip_machine_header;
        self.prev_data.clear();
    }

    pub fn clear_result(&mut self) {
        self.records.clear();
        self.open_record = None;
    }

    pub fn records(&self) -> &[SectionRecord] {
        &self.records
    }

    /// Gap length before a section for a baud tier, doubling on the
    /// double-speed variant.
    pub fn gap_length(baud: usize, fsk_speed: usize) -> usize {
        let mut idx = baud;
        if idx >= 3 {
            idx = 0;
        }
        idx += fsk_speed & 1;
        GAP_LENGTH[idx]
    }

    fn record(&mut self) -> &mut SectionRecord {
        let idx = match self.open_record {
            Some(idx) => idx,
            None => {
                self.records.push(SectionRecord::new());
                let idx = self.records.len() - 1;
                self.open_record = Some(idx);
                idx
            }
        };
        &mut self.records[idx]
    }

    /// Walk the byte stream: hunt for section idents and parse each section,
    /// appending payload bytes to `out` when one is given.
    pub fn decode(&mut self, b_data: &mut SampleStream, mut out: Option<&mut Vec<u8>>) -> StageSignal {
        loop {
            let b_last = b_data.is_last_data();
            if !b_last && b_data.is_tail(256) {
                return StageSignal::NeedMoreData;
            }
            if b_last && b_data.is_tail(0) {
                return StageSignal::Complete;
            }

            match self.phase {
                SectionPhase::FindHeader => self.find_header(b_data),
                SectionPhase::NameSection => {
                    if self.parse_name_section(b_data, out.is_some()) {
                        self.phase = SectionPhase::FindHeader;
                    } else {
                        return StageSignal::NeedMoreData;
                    }
                }
                SectionPhase::BodySection => {
                    if self.parse_body_section(b_data, out.as_deref_mut()) {
                        self.phase = SectionPhase::FindHeader;
                    } else {
                        return StageSignal::NeedMoreData;
                    }
                }
                SectionPhase::FooterSection => {
                    if self.parse_footer_section(b_data, out.as_deref_mut()) {
                        self.phase = SectionPhase::FindHeader;
                    } else {
                        return StageSignal::NeedMoreData;
                    }
                }
            }
        }
    }

    fn find_header(&mut self, b_data: &mut SampleStream) {
        if b_data.compare_read(0, &SECTION_IDENT[..3]) != 0 {
            b_data.add_read_pos(1);
            return;
        }
        self.record();
        match b_data.get_read(3).data {
            TYPE_NAME => self.phase = SectionPhase::NameSection,
            TYPE_BODY => self.phase = SectionPhase::BodySection,
            TYPE_FOOTER => self.phase = SectionPhase::FooterSection,
            other => {
                log::trace!("binary: unknown section type {:#04x}", other);
                b_data.add_read_pos(1);
                return;
            }
        }
        b_data.add_read_pos(4);
    }

    /// Returns false when the section runs past the buffered data and the
    /// caller has to refill first.
    fn parse_name_section(&mut self, b_data: &mut SampleStream, emit_real: bool) -> bool {
        self.record().flags |= FLAG_NAME;
        let head = b_data.get_read(0);
        self.record().baud = head.baud;
        let data_len = head.data as usize;
        if !b_data.is_last_data() && b_data.is_tail(data_len + 6) {
            return false;
        }
        b_data.add_read_pos(1);

        let start = b_data.get_read(0);
        let mut chk_sum_calc = data_len as u32;
        for i in 0..data_len {
            let sample = b_data.read();
            if i < 20 {
                self.save_data_name[i] = sample.data;
            }
            chk_sum_calc += sample.data as u32;
        }
        self.save_data_name[20] = 0;
        let name = self.save_data_name;
        self.record().name = name;

        let chk = b_data.read();
        if chk_sum_calc & 0xff != chk.data as u32 {
            self.record().chksum_errors.push((start.spos, chk.spos));
        }
        log::debug!("binary: name section at spos={}", start.spos);

        if emit_real {
            self.prev_data.clear();
        }
        true
    }

    fn parse_body_section(&mut self, b_data: &mut SampleStream, out: Option<&mut Vec<u8>>) -> bool {
        self.record().flags |= FLAG_BODY;
        let data_len = b_data.get_read(0).data as usize;
        if !b_data.is_last_data() && b_data.is_tail(data_len + 6) {
            return false;
        }
        b_data.add_read_pos(1);

        let start = b_data.get_read(0);
        let mut chk_sum_calc = TYPE_BODY as u32 + data_len as u32;
        self.record().data_count += 1;

        let mut body: Vec<u8> = Vec::with_capacity(data_len);
        for i in 0..data_len {
            let sample = b_data.read();
            if i < 255 {
                body.push(sample.data);
            }
            chk_sum_calc += sample.data as u32;
        }

        let chk = b_data.read();
        if chk_sum_calc & 0xff != chk.data as u32 {
            self.record().chksum_errors.push((start.spos, chk.spos));
        }

        if let Some(out) = out {
            // strip the loader header off the first machine-code block
            let first_machine = self.strip_machine_header
                && self.record().data_format() == 2
                && self.record().data_count == 1;
            let payload = if first_machine && body.len() >= 5 {
                &body[5..]
            } else {
                &body[..]
            };
            out.extend_from_slice(&self.prev_data);
            self.prev_data.clear();
            self.prev_data.extend_from_slice(payload);
        }
        true
    }

    fn parse_footer_section(&mut self, b_data: &mut SampleStream, out: Option<&mut Vec<u8>>) -> bool {
        self.record().flags |= FLAG_FOOTER;
        let data_len = b_data.get_read(0).data as usize;
        if !b_data.is_last_data() && b_data.is_tail(data_len + 6) {
            return false;
        }
        b_data.add_read_pos(1);

        let start = b_data.get_read(0);
        let mut chk_sum_calc = TYPE_FOOTER as u32 + data_len as u32;
        for _ in 0..data_len {
            chk_sum_calc += b_data.read().data as u32;
        }
        let chk = b_data.read();
        if chk_sum_calc & 0xff != chk.data as u32 {
            self.record().chksum_errors.push((start.spos, chk.spos));
        }

        if let Some(out) = out {
            // the loader trailer sits at the end of the last block
            if self.strip_machine_header && self.record().data_format() == 2 {
                let keep = self.prev_data.len().saturating_sub(5);
                self.prev_data.truncate(keep);
            }
            out.extend_from_slice(&self.prev_data);
            self.prev_data.clear();
        }
        self.open_record = None;
        true
    }

    /// Set save metadata for the encode side: up to 8 name chars, the file
    /// format and the save mode.
    pub fn set_save_data_info(&mut self, name: &[u8], fmt: u8, mode: u8) {
        self.save_data_name = [0; 21];
        for (i, &b) in name.iter().take(8).enumerate() {
            self.save_data_name[i] = b;
        }
        self.save_data_name[8] = fmt;
        self.save_data_name[9] = mode;
        self.save_data_name[10] = mode;
    }

    pub fn clear_prev_data(&mut self) {
        self.prev_data.clear();
    }

    pub fn add_prev_data(&mut self, data: u8) {
        self.prev_data.push(data);
    }

    pub fn prev_data_len(&self) -> usize {
        self.prev_data.len()
    }

    fn put_section(b_data: &mut SampleStream, gap_len: usize, kind: u8, payload: &[u8]) {
        b_data.repeat(0xff, gap_len, 0, -1, 0);
        let dlen = payload.len().min(255);
        let chk_sum = kind as u32
            + dlen as u32
            + payload[..dlen].iter().map(|&d| d as u32).sum::<u32>();
        let mut buf = Vec::with_capacity(dlen + 9);
        buf.extend_from_slice(&SECTION_IDENT[1..3]);
        buf.push(kind);
        buf.push(dlen as u8);
        buf.extend_from_slice(&payload[..dlen]);
        buf.push((chk_sum & 0xff) as u8);
        buf.extend_from_slice(&[0; 4]);
        b_data.push_bytes(&buf, 0, -1, 0);
    }

    pub fn put_header_section(&mut self, b_data: &mut SampleStream, gap_len: usize) {
        let name = self.save_data_name;
        Self::put_section(b_data, gap_len, TYPE_NAME, &name[..20]);
    }

    /// Emit the buffered body bytes as one section. Returns true for a
    /// binary save, whose following gaps shrink to 10 bytes.
    pub fn put_body_section(&mut self, b_data: &mut SampleStream, gap_len: usize) -> bool {
        let body = std::mem::take(&mut self.prev_data);
        Self::put_section(b_data, gap_len, TYPE_BODY, &body);
        self.save_data_name[9] == 0
    }

    pub fn put_footer_section(&mut self, b_data: &mut SampleStream, gap_len: usize) {
        Self::put_section(b_data, gap_len, TYPE_FOOTER, &[]);
    }
}

impl Default for BinarySectionStage {
    fn default() -> Self {
        BinarySectionStage::new()
    }
}
