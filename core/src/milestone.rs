//! Periodic bookmarks over the source audio.
//!
//! The viewer can scrub backwards through a recording that is far larger
//! than the in-memory buffers. Decoding marks a milestone at fixed source
//! position intervals, storing just enough parser state (detected baud,
//! carrier phase and flip, serial frame position) to resume from that point
//! after rewinding the input.

/// Parser state snapshot at one source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Milestone {
    pub spos: i32,
    pub baud: i8,
    pub c_phase: u8,
    pub c_frip: u8,
    pub sn_sta: u8,
    pub s_data_pos: i8,
}

impl Milestone {
    pub fn new(spos: i32) -> Self {
        Milestone {
            spos,
            ..Default::default()
        }
    }
}

impl Default for Milestone {
    fn default() -> Self {
        Milestone {
            spos: 0,
            baud: -1,
            c_phase: 0,
            c_frip: 0,
            sn_sta: 0,
            s_data_pos: -1,
        }
    }
}

/// Milestone list with a fixed marking interval.
pub struct MilestoneLog {
    marks: Vec<Milestone>,
    boundary: i32,
    next_spos: i32,
    prev_spos: i32,
}

impl MilestoneLog {
    pub fn new() -> Self {
        MilestoneLog {
            marks: Vec::new(),
            boundary: 0,
            next_spos: 0,
            prev_spos: 0,
        }
    }

    pub fn clear(&mut self, boundary: i32) {
        self.marks.clear();
        self.boundary = boundary;
        self.next_spos = boundary;
        self.prev_spos = boundary;
    }

    /// Add a mark once the source position crosses the next interval
    /// boundary. Returns true when a mark was added.
    pub fn mark_if_need(&mut self, spos: i32) -> bool {
        if spos >= self.next_spos {
            self.marks.push(Milestone::new(spos));
            self.prev_spos = self.next_spos;
            self.next_spos += self.boundary;
            true
        } else {
            false
        }
    }

    /// Attach parser state to the latest mark, but only while the decode
    /// position is still within the last eighth of the interval before it.
    pub fn modify_mark_if_need(
        &mut self,
        spos: i32,
        baud: i8,
        c_phase: u8,
        c_frip: u8,
        sn_sta: u8,
        s_data_pos: i8,
    ) -> bool {
        if !self.marks.is_empty()
            && spos > (self.prev_spos - self.boundary / 8)
            && spos <= self.prev_spos
        {
            let ms = self.marks.last_mut().unwrap();
            ms.spos = spos;
            ms.baud = baud;
            ms.c_phase = c_phase;
            ms.c_frip = c_frip;
            ms.sn_sta = sn_sta;
            ms.s_data_pos = s_data_pos;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Milestone {
        self.marks.last().copied().unwrap_or_default()
    }

    pub fn current_spos(&self) -> i32 {
        self.current().spos
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Drop the newest `cnt` marks, stepping the interval cursors back.
    pub fn unshift(&mut self, cnt: usize) {
        for _ in 0..cnt {
            if self.marks.pop().is_none() {
                break;
            }
            self.next_spos = self.prev_spos;
            self.prev_spos -= self.boundary;
        }
    }

    /// Drop every mark newer than `spos`.
    pub fn unshift_by_spos(&mut self, spos: i32) {
        while let Some(last) = self.marks.last() {
            if last.spos <= spos {
                break;
            }
            self.marks.pop();
            self.next_spos = self.prev_spos;
            self.prev_spos -= self.boundary;
        }
    }
}

impl Default for MilestoneLog {
    fn default() -> Self {
        MilestoneLog::new()
    }
}
