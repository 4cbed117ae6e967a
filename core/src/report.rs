//! Decode and encode summaries.
//!
//! Every stage tallies its own results while running; these renderers turn
//! the tallies into the per-conversion report lines. Output goes through a
//! [`LogSink`] so the caller decides where the text lands: a collected
//! buffer, the process log, or both.

use crate::binary::{SectionRecord, FLAG_BODY, FLAG_FOOTER, FLAG_NAME};
use crate::dft::CorrectionType;
use crate::pipeline::ChkWave;
use crate::serial::{self, FrameErrors};
use crate::wave::{LambdaTable, WaveStats};
use crate::BAUD_RATE;

/// Receiver for report lines.
pub trait LogSink {
    fn write_line(&mut self, line: &str);
}

impl LogSink for Vec<String> {
    fn write_line(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// Sink that forwards every line to the process log at info level.
pub struct LogWriter;

impl LogSink for LogWriter {
    fn write_line(&mut self, line: &str) {
        log::info!("{}", line);
    }
}

/// Microseconds a source position corresponds to at `rate`.
pub fn spos_usec(spos: i32, rate: f64) -> u32 {
    if rate <= 0.0 || spos <= 0 {
        return 0;
    }
    (spos as f64 * 1_000_000.0 / rate) as u32
}

/// Time display `m'ss".mmm`, rounded to the millisecond.
pub fn time_str(usec: u32) -> String {
    let ms = (usec + 500) / 1000;
    let sec = ms / 1000;
    let msec = ms % 1000;
    let min = sec / 60;
    let sec = sec % 60;
    format!("{}'{:02}\".{:03}", min, sec, msec)
}

/// Printable form of an internal 8-char save name. Codes outside the ASCII
/// range display as `?`.
pub fn internal_name(name: &[u8]) -> String {
    name.iter()
        .take(8)
        .map(|&b| {
            if (0x20..=0x7f).contains(&b) {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

fn freq_of(us: f64) -> f64 {
    if us > 0.0 {
        1_000_000.0 / us
    } else {
        0.0
    }
}

/// Audio-to-carrier summary: detection settings, acceptance windows and the
/// wavelength tallies.
#[allow(clippy::too_many_arguments)]
pub fn wave_decode_report(
    sink: &mut dyn LogSink,
    lamda: &LambdaTable,
    stats: &WaveStats,
    fsk_speed: usize,
    half_wave: bool,
    reverse: bool,
    correct_type: CorrectionType,
    ranges: [u32; 2],
) {
    let spd = fsk_speed;
    sink.write_line(" [ wav -> l3c ]");
    sink.write_line(&format!(
        "  Wave Type: {}",
        if spd != 0 {
            "Double Speed FSK"
        } else {
            "Standard FSK"
        }
    ));
    sink.write_line(&format!(
        "  Detection: {}",
        if half_wave { "Half wave" } else { "Full wave" }
    ));
    for (n, label) in ["Long(0) ", "Short(1)"].iter().enumerate() {
        let us = lamda.us[spd + n];
        let us_min = lamda.us_min[spd + n];
        let us_max = lamda.us_max[spd + n];
        sink.write_line(&format!(
            "  Range: {}: {:2}% ({:3.3}us({:6.1}Hz) - {:3.3}us({:6.1}Hz) - {:3.3}us({:6.1}Hz))",
            label,
            ranges[n],
            us_max,
            freq_of(us_max),
            us,
            freq_of(us),
            us_min,
            freq_of(us_min),
        ));
    }
    sink.write_line(&format!(
        "  Wave Reverse: {}",
        if reverse { "on" } else { "off" }
    ));
    sink.write_line(&format!(
        "  Correct: {}",
        if correct_type != CorrectionType::None {
            "on"
        } else {
            "off"
        }
    ));
    if correct_type != CorrectionType::None {
        sink.write_line(&format!(
            "  Correct Type: {}",
            if correct_type == CorrectionType::Sine {
                "sin wave"
            } else {
                "cos wave"
            }
        ));
    }
    sink.write_line("  Wave Sum:");
    sink.write_line(&format!(
        "    Long(0) : {:8} Cent:{:6.1}Hz Avg:{:6.1}Hz",
        stats.sample_num[0],
        freq_of(lamda.us[spd]),
        freq_of(lamda.us_avg[spd]),
    ));
    sink.write_line(&format!(
        "    Short(1): {:8} Cent:{:6.1}Hz Avg:{:6.1}Hz",
        stats.sample_num[1],
        freq_of(lamda.us[spd + 1]),
        freq_of(lamda.us_avg[spd + 1]),
    ));
    sink.write_line(&format!(
        "    Middle  : {:8} Cent:{:6.1}Hz Avg:{:6.1}Hz",
        stats.sample_num[2],
        freq_of(lamda.us_mid[spd]),
        freq_of(lamda.us_mid_avg[spd]),
    ));
    sink.write_line(&format!("    Too Long : {:8}", stats.sample_num[3]));
    sink.write_line(&format!("    Too Short: {:8}", stats.sample_num[4]));
    sink.write_line(&format!("    Error    : {:8}", stats.sample_num[5]));
    sink.write_line("");
}

pub fn wave_encode_report(sink: &mut dyn LogSink, rate: u32, bits: u16, channels: u16) {
    sink.write_line(" [ l3c -> wav ]");
    sink.write_line(&format!(" {}Hz {}bit {}ch", rate, bits, channels));
    sink.write_line("");
}

/// Carrier-to-serial summary: mismatch rate over everything consumed.
pub fn carrier_decode_report(sink: &mut dyn LogSink, error_num: u32, total_read: i64) {
    sink.write_line(" [ l3c -> l3b, t9x ]");
    if total_read > 0 {
        sink.write_line(&format!(
            " {} / {} errors. ({:.2}%)",
            error_num,
            total_read,
            error_num as f64 * 100.0 / total_read as f64,
        ));
    }
    sink.write_line("");
}

pub fn carrier_encode_report(sink: &mut dyn LogSink, baud: usize, fsk_speed: usize) {
    sink.write_line(" [ l3b, t9x -> l3c ]");
    sink.write_line(&format!(
        " {:4} Baud",
        BAUD_RATE[baud & 3] as usize * (fsk_speed + 1)
    ));
    sink.write_line("");
}

/// Serial-to-byte summary: the frame layout, the error rate and the first
/// error positions as times in the source audio.
pub fn serial_decode_report(
    sink: &mut dyn LogSink,
    errors: &FrameErrors,
    total_read: i64,
    word_select: u8,
    rate: f64,
) {
    sink.write_line(" [ l3b, t9x -> l3 ]");

    let mut line = format!(" {}bits", serial::data_bits(word_select));
    line += match serial::parity_select(word_select) {
        1 => " OddParity",
        0 => " EvenParity",
        _ => " NoParity",
    };
    if serial::stop_bits(word_select) == 1 {
        line += " 1stopbit";
    } else {
        line += " 2stopbit";
    }
    sink.write_line(&line);

    if total_read > 0 {
        sink.write_line(&format!(
            " {} / {} errors. ({:.2}%)",
            errors.err_num,
            total_read,
            errors.err_num as f64 * 100.0 / total_read as f64,
        ));
        let col_max = 5;
        let mut col = 0;
        let mut line = String::new();
        for &spos in &errors.positions {
            line += if col == 0 { "  " } else { ", " };
            line += &format!("{} ({})", spos, time_str(spos_usec(spos, rate)));
            col += 1;
            if col == col_max {
                sink.write_line(&line);
                col = 0;
                line.clear();
            }
        }
        if errors.over {
            line += "  and more...";
            col += 1;
        }
        if col > 0 {
            sink.write_line(&line);
        }
    }
    sink.write_line("");
}

pub fn serial_encode_report(sink: &mut dyn LogSink, word_select: u8, baud: usize, fsk_speed: usize) {
    sink.write_line(" [ l3 -> l3b, t9x ]");

    let mut line = format!(" {}bits", serial::data_bits(word_select));
    line += match serial::parity_select(word_select) {
        1 => " OddParity",
        0 => " EvenParity",
        _ => " NoParity",
    };
    if serial::stop_bits(word_select) == 1 {
        line += " 1stopbit";
    } else {
        line += " 2stopbit";
    }
    sink.write_line(&line);
    sink.write_line(&format!(
        " {:4} Baud",
        BAUD_RATE[baud & 3] as usize * (fsk_speed + 1)
    ));
    sink.write_line("");
}

/// Byte-to-payload summary: one block per save with name, type, baud and
/// checksum results.
pub fn binary_decode_report(
    sink: &mut dyn LogSink,
    records: &[SectionRecord],
    fsk_speed: usize,
    rate: f64,
) {
    sink.write_line(" [ l3 -> real data ]");
    if records.is_empty() {
        sink.write_line(" data cannot parse.");
        sink.write_line("");
        return;
    }
    for (idx, rec) in records.iter().enumerate() {
        sink.write_line(&format!("{:03}:", idx + 1));
        if rec.flags & FLAG_NAME != 0 {
            let mut line = format!(" dataname: \"{}\"   [", internal_name(&rec.name));
            line += match rec.data_format() {
                0 => "BASIC",
                1 => "DATA",
                2 => "Machine",
                _ => "?",
            };
            line += match rec.save_mode() {
                0 => " - Binary save",
                0xff => " - Ascii save",
                _ => " ?",
            };
            line += "]";
            let baud = rec.baud as i32;
            if (0..4).contains(&baud) {
                line += &format!(
                    " ({:4}baud)",
                    BAUD_RATE[baud as usize] as usize * (fsk_speed + 1)
                );
            } else {
                line += " (----baud)";
            }
            sink.write_line(&line);
        } else {
            sink.write_line(" no filename");
            sink.write_line(" header section not found.");
        }
        if rec.flags & FLAG_BODY == 0 {
            sink.write_line(" data section not found.");
        }
        if rec.flags & FLAG_FOOTER == 0 {
            sink.write_line(" footer section not found.");
        }
        if rec.chksum_errors.is_empty() {
            sink.write_line(" check sum ok.");
        } else {
            sink.write_line(" check sum error exists.");
        }
        for &(start, end) in &rec.chksum_errors {
            sink.write_line(&format!(
                " pos: {}-{} ({}-{})",
                start,
                end,
                time_str(spos_usec(start, rate)),
                time_str(spos_usec(end, rate)),
            ));
        }
    }
    sink.write_line("");
}

/// Analyzer summary: the tallies of all four probe runs (two FSK speeds,
/// two correction templates) followed by the settings the analyzer picked.
pub fn analyze_report(
    sink: &mut dyn LogSink,
    chkwav: &[ChkWave; 2],
    lamda: &LambdaTable,
    fsk_speed: usize,
    reverse: bool,
    correct_type: CorrectionType,
    baud: usize,
) {
    sink.write_line("----- Result Report -----");
    for (spd, chk) in chkwav.iter().enumerate() {
        sink.write_line("");
        sink.write_line(&format!(
            "  Wave Type: {}",
            if spd != 0 {
                "Double Speed FSK"
            } else {
                "Standard FSK"
            }
        ));
        for cor in 0..2 {
            sink.write_line(if cor == 0 {
                "    Cos Wave:"
            } else {
                "    Sin Wave:"
            });
            sink.write_line(&format!(
                "      Long(0)  : {:8} Cent:{:6.1}Hz Avg:{:6.1}Hz",
                chk.sample_num[cor][0],
                freq_of(lamda.us[spd]),
                freq_of(chk.us0avg[cor]),
            ));
            sink.write_line(&format!(
                "      Short(1) : {:8} Cent:{:6.1}Hz Avg:{:6.1}Hz",
                chk.sample_num[cor][1],
                freq_of(lamda.us[spd + 1]),
                freq_of(chk.us1avg[cor]),
            ));
            sink.write_line(&format!("      Middle   : {:8}", chk.sample_num[cor][2]));
            sink.write_line(&format!("      Too Long : {:8}", chk.sample_num[cor][3]));
            sink.write_line(&format!("      Too Short: {:8}", chk.sample_num[cor][4]));
            let mut line = String::new();
            for tier in 0..4 {
                line += &format!(
                    "      {}baud: {:4}",
                    BAUD_RATE[tier] as usize * (spd + 1),
                    chk.baud_num[cor][tier]
                );
            }
            sink.write_line(&line);
            sink.write_line(&format!(
                "      Normal : {:4}  Reverse : {:4}  AmpMax : {:4}  AmpMin : {:4}  Serial Err:{}",
                chk.rev_num[cor][0],
                chk.rev_num[cor][1],
                chk.amp_max[cor],
                chk.amp_min[cor],
                chk.ser_err[cor],
            ));
        }
    }
    sink.write_line("");
    sink.write_line(" [ result ]");
    sink.write_line(&format!(
        "  Wave Type: {}",
        if fsk_speed != 0 {
            "Double Speed FSK"
        } else {
            "Standard FSK"
        }
    ));
    sink.write_line(&format!(
        "  Wave Reverse: {}",
        if reverse { "on" } else { "off" }
    ));
    sink.write_line(&format!(
        "  Correct Type: {}",
        if correct_type == CorrectionType::Sine {
            "sin wave"
        } else {
            "cos wave"
        }
    ));
    sink.write_line(&format!(
        "  {:4} Baud",
        BAUD_RATE[baud & 3] as usize * (fsk_speed + 1)
    ));
    sink.write_line("");
}
