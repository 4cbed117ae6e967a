use rand::Rng;
use tapewave_core::{
    resample, FileType, PipelineInput, PipelineOrchestrator, PipelineParams,
};

fn payload() -> Vec<u8> {
    b"10 PRINT \"HELLO\"\r\n20 GOTO 10\r\n".to_vec()
}

fn encode_params() -> PipelineParams {
    PipelineParams {
        baud: 1,
        save_name: b"HELLO".to_vec(),
        save_format: 0,
        save_mode: 0xff,
        ..PipelineParams::default()
    }
}

fn convert(params: PipelineParams, input: PipelineInput, out: FileType) -> Vec<u8> {
    let mut pipe = PipelineOrchestrator::new(params);
    pipe.run(input, out).expect("conversion failed")
}

#[test]
fn test_pure_low_tone_classifies_all_long_half_waves() {
    let rate = 48000u32;
    // one second of clean 1200 Hz, phase-offset so the stream does not
    // open on an exact zero sample
    let samples: Vec<i16> = (0..rate as usize)
        .map(|i| {
            let v = (2.0 * std::f64::consts::PI * 1200.0 * (i as f64 + 0.5) / rate as f64).sin();
            (v * 12000.0) as i16
        })
        .collect();

    let mut pipe = PipelineOrchestrator::new(PipelineParams::default());
    pipe.run(PipelineInput::Wav { samples, rate }, FileType::L3c)
        .unwrap();
    let stats = pipe.wave_stats();
    // ~2400 half-waves, every one in the long window
    assert!(stats.sample_num[0] > 2000, "long = {}", stats.sample_num[0]);
    assert_eq!(stats.sample_num[1], 0, "short");
    assert_eq!(stats.sample_num[3], 0, "too long");
    assert_eq!(stats.sample_num[4], 0, "too short");
}

#[test]
fn test_round_trip_every_baud_tier() {
    for baud in 0..4usize {
        let params = PipelineParams {
            baud,
            ..encode_params()
        };
        let wav = convert(params, PipelineInput::Real(payload()), FileType::Wav);
        let samples: Vec<i16> = wav.iter().map(|&d| resample::to_i16(d)).collect();

        let mut dec = PipelineOrchestrator::new(PipelineParams::default());
        let out = dec
            .run(
                PipelineInput::Wav {
                    samples,
                    rate: 48000,
                },
                FileType::Real,
            )
            .unwrap();
        assert_eq!(out, payload(), "baud tier {}", baud);
        assert_eq!(dec.records()[0].baud, baud as i8, "baud tier {}", baud);
    }
}

#[test]
fn test_round_trip_double_speed_fsk() {
    let params = PipelineParams {
        fsk_speed: 1,
        ..encode_params()
    };
    let wav = convert(params, PipelineInput::Real(payload()), FileType::Wav);
    let samples: Vec<i16> = wav.iter().map(|&d| resample::to_i16(d)).collect();

    let dec_params = PipelineParams {
        fsk_speed: 1,
        ..PipelineParams::default()
    };
    let mut dec = PipelineOrchestrator::new(dec_params);
    let out = dec
        .run(
            PipelineInput::Wav {
                samples,
                rate: 48000,
            },
            FileType::Real,
        )
        .unwrap();
    assert_eq!(out, payload());
    assert_eq!(dec.records()[0].baud, 1);
}

#[test]
fn test_real_l3b_real_round_trip() {
    let l3b = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::L3b,
    );
    assert!(l3b
        .iter()
        .all(|&b| matches!(b, b'0' | b'1' | b'\r' | b'\n')));

    let out = convert(
        PipelineParams::default(),
        PipelineInput::L3b(l3b),
        FileType::Real,
    );
    assert_eq!(out, payload());
}

#[test]
fn test_l3_and_direct_t9x_agree() {
    let l3 = convert(encode_params(), PipelineInput::Real(payload()), FileType::L3);
    let via_l3 = convert(encode_params(), PipelineInput::L3(l3), FileType::T9x);
    let direct = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::T9x,
    );
    assert_eq!(via_l3, direct);
}

#[test]
fn test_t9x_wav_t9x_round_trip() {
    let t9x = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::T9x,
    );
    let wav = convert(
        encode_params(),
        PipelineInput::T9x(t9x.clone()),
        FileType::Wav,
    );

    let samples: Vec<i16> = wav.iter().map(|&d| resample::to_i16(d)).collect();
    let back = convert(
        PipelineParams::default(),
        PipelineInput::Wav {
            samples,
            rate: 48000,
        },
        FileType::T9x,
    );
    // the trailing dummy carrier after the footer adds no frames
    assert_eq!(&back[..t9x.len()], &t9x[..]);
}

#[test]
fn test_l3c_text_is_filtered_on_input() {
    let l3c = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::L3c,
    );
    // inject noise a text editor might leave behind
    let mut dirty = Vec::new();
    for chunk in l3c.chunks(40) {
        dirty.extend_from_slice(chunk);
        dirty.extend_from_slice(b" \t");
    }
    let out = convert(
        PipelineParams::default(),
        PipelineInput::L3c(dirty),
        FileType::Real,
    );
    assert_eq!(out, payload());
}

#[test]
fn test_decode_survives_moderate_noise() {
    let _ = env_logger::builder().is_test(true).try_init();

    let wav = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::Wav,
    );
    let mut rng = rand::thread_rng();
    let samples: Vec<i16> = wav
        .iter()
        .map(|&d| resample::to_i16(d).saturating_add(rng.gen_range(-800..=800)))
        .collect();

    let out = convert(
        PipelineParams::default(),
        PipelineInput::Wav {
            samples,
            rate: 48000,
        },
        FileType::Real,
    );
    assert_eq!(out, payload());
}

#[test]
fn test_decoded_records_carry_save_metadata() {
    let wav = convert(
        encode_params(),
        PipelineInput::Real(payload()),
        FileType::Wav,
    );
    let samples: Vec<i16> = wav.iter().map(|&d| resample::to_i16(d)).collect();

    let mut pipe = PipelineOrchestrator::new(PipelineParams::default());
    let out = pipe
        .run(
            PipelineInput::Wav {
                samples,
                rate: 48000,
            },
            FileType::Real,
        )
        .unwrap();
    assert_eq!(out, payload());

    let recs = pipe.records();
    assert_eq!(recs.len(), 1);
    assert_eq!(&recs[0].name[..5], b"HELLO");
    assert_eq!(recs[0].data_format(), 0);
    assert_eq!(recs[0].save_mode(), 0xff);
    assert_eq!(recs[0].data_count, 1);
    assert!(recs[0].chksum_errors.is_empty());
}
