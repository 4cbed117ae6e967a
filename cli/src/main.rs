use clap::{Parser, Subcommand, ValueEnum};
use hound::WavSpec;
use std::fs::File;
use std::path::{Path, PathBuf};
use tapewave_core::dft::CorrectionType;
use tapewave_core::report::LogSink;
use tapewave_core::{
    resample, FileType, PipelineInput, PipelineOrchestrator, PipelineParams, TapeError,
};

#[derive(Parser)]
#[command(name = "tapewave")]
#[command(about = "Recover and synthesize cassette tape data images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CorrectArg {
    None,
    Cos,
    Sin,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert between formats, picked by file extension
    /// (.wav, .l3c, .l3b, .t9x, .l3, anything else is raw data)
    Convert {
        /// Input file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output file
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Probe the recording first and take over its settings
        #[arg(short, long)]
        analyze: bool,

        /// FSK speed: 0 standard, 1 double
        #[arg(short = 's', long, default_value = "0")]
        fsk_speed: usize,

        /// Baud tier: 0=600, 1=1200, 2=2400, 3=300
        #[arg(short, long, default_value = "0")]
        baud: usize,

        /// Lock the baud tier instead of detecting it per frame
        #[arg(long)]
        no_auto_baud: bool,

        /// Decode an inverted recording
        #[arg(short, long)]
        reverse: bool,

        /// Measure only alternate zero crossings
        #[arg(long)]
        full_wave: bool,

        /// Serial frame layout selector
        #[arg(short, long, default_value = "4", value_parser = parse_hex_u8)]
        word_select: u8,

        /// Waveform correction template
        #[arg(short, long, value_enum, default_value = "none")]
        correct: CorrectArg,

        /// Keep bytes from frames with parity or stop errors
        #[arg(long)]
        out_err_bytes: bool,

        /// Drop the machine-code header from raw output
        #[arg(long)]
        strip_header: bool,

        /// Use the baud-dependent gap length for byte-level outputs
        #[arg(long)]
        change_gap: bool,

        /// WAV output sample rate
        #[arg(long, default_value = "48000")]
        out_rate: u32,

        /// Internal name for synthesized tapes (up to 8 chars)
        #[arg(short, long)]
        name: Option<String>,

        /// Data format for synthesized tapes: 0 BASIC, 1 data, 2 machine code
        #[arg(long, default_value = "0")]
        format: u8,

        /// Write an ascii-mode save instead of binary
        #[arg(long)]
        ascii: bool,
    },

    /// Probe a WAV recording and report the detected settings
    Analyze {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,
    },
}

/// Report sink that prints to stdout.
struct Stdout;

impl LogSink for Stdout {
    fn write_line(&mut self, line: &str) {
        println!("{}", line);
    }
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let s = s.trim_start_matches("0x");
    u8::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            output,
            analyze,
            fsk_speed,
            baud,
            no_auto_baud,
            reverse,
            full_wave,
            word_select,
            correct,
            out_err_bytes,
            strip_header,
            change_gap,
            out_rate,
            name,
            format,
            ascii,
        } => {
            let params = PipelineParams {
                fsk_speed,
                baud,
                auto_baud: !no_auto_baud,
                reverse,
                half_wave: !full_wave,
                word_select,
                correct_type: match correct {
                    CorrectArg::None => CorrectionType::None,
                    CorrectArg::Cos => CorrectionType::Cosine,
                    CorrectArg::Sin => CorrectionType::Sine,
                },
                out_err_bytes,
                strip_machine_header: strip_header,
                change_gap,
                out_rate,
                save_name: name.map(|n| n.into_bytes()).unwrap_or_default(),
                save_format: format,
                save_mode: if ascii { 0xff } else { 0 },
                ..PipelineParams::default()
            };
            convert_command(&input, &output, params, analyze)?
        }
        Commands::Analyze { input } => analyze_command(&input)?,
    }

    Ok(())
}

fn file_type_of(path: &Path) -> FileType {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("wav") => FileType::Wav,
        Some("l3c") => FileType::L3c,
        Some("l3b") => FileType::L3b,
        Some("t9x") => FileType::T9x,
        Some("l3") => FileType::L3,
        _ => FileType::Real,
    }
}

fn read_input(path: &Path) -> Result<PipelineInput, Box<dyn std::error::Error>> {
    match file_type_of(path) {
        FileType::Wav => {
            let (samples, rate) = read_wav(path)?;
            Ok(PipelineInput::Wav { samples, rate })
        }
        FileType::L3c => Ok(PipelineInput::L3c(std::fs::read(path)?)),
        FileType::L3b => Ok(PipelineInput::L3b(std::fs::read(path)?)),
        FileType::T9x => Ok(PipelineInput::T9x(std::fs::read(path)?)),
        FileType::L3 => Ok(PipelineInput::L3(std::fs::read(path)?)),
        FileType::Real => Ok(PipelineInput::Real(std::fs::read(path)?)),
    }
}

fn read_wav(path: &Path) -> Result<(Vec<i16>, u32), Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    log::info!(
        "read wav: {} Hz, {} channels, {} bits",
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 8) => {
            let raw: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
            raw?.into_iter().map(|s| s << 8).collect()
        }
        (hound::SampleFormat::Int, 16) => {
            let raw: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
            raw?
        }
        (hound::SampleFormat::Float, 32) => {
            let raw: Result<Vec<f32>, _> = reader.samples::<f32>().collect();
            raw?
                .into_iter()
                .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect()
        }
        (_, bits) => {
            return Err(TapeError::UnsupportedWavFormat(bits).into());
        }
    };
    let mono = resample::first_channel(&samples, spec.channels as usize);
    Ok((mono, spec.sample_rate))
}

fn write_wav(path: &Path, data: &[u8], rate: u32) -> Result<(), Box<dyn std::error::Error>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 8,
        sample_format: hound::SampleFormat::Int,
    };
    let file = File::create(path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for &d in data {
        // centered u8 to the signed domain hound expects
        writer.write_sample((d as i16 - 128) as i8)?;
    }
    writer.finalize()?;
    Ok(())
}

fn convert_command(
    input_path: &PathBuf,
    output_path: &PathBuf,
    params: PipelineParams,
    analyze_first: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // creating the output truncates it, so catch in-place conversion
    // before the input is opened
    let same = match (input_path.canonicalize(), output_path.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => input_path == output_path,
    };
    if same {
        return Err(TapeError::InvalidConfig(
            "input and output are the same file".to_string(),
        )
        .into());
    }

    let out_type = file_type_of(output_path);
    let mut pipe = PipelineOrchestrator::new(params);

    if analyze_first {
        if file_type_of(input_path) != FileType::Wav {
            return Err(TapeError::InvalidConfig(
                "analysis needs a wav input".to_string(),
            )
            .into());
        }
        let (samples, rate) = read_wav(input_path)?;
        pipe.analyze(&samples, rate)?;
        pipe.analyze_report(&mut Stdout);
    }

    let input = read_input(input_path)?;
    let out = pipe.run(input, out_type)?;

    if out_type == FileType::Wav {
        write_wav(output_path, &out, pipe.params().out_rate)?;
    } else {
        std::fs::write(output_path, &out)?;
    }
    println!(
        "Wrote {} bytes to {}",
        out.len(),
        output_path.display()
    );

    pipe.report(&mut Stdout);
    Ok(())
}

fn analyze_command(input_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (samples, rate) = read_wav(input_path)?;
    println!("Read {} samples at {} Hz", samples.len(), rate);

    let mut pipe = PipelineOrchestrator::new(PipelineParams::default());
    pipe.analyze(&samples, rate)?;
    pipe.analyze_report(&mut Stdout);
    Ok(())
}
