use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn tmp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tapewave-cli-tests");
    fs::create_dir_all(&dir).ok();
    dir.join(name)
}

fn run_tapewave(args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_tapewave"))
        .args(args)
        .output()
        .expect("Failed to execute tapewave");
    let text = String::from_utf8_lossy(&output.stderr).to_string()
        + &String::from_utf8_lossy(&output.stdout);
    (output.status.success(), text)
}

#[test]
fn test_convert_real_to_wav_and_back() {
    let input = tmp_path("roundtrip.bin");
    fs::write(&input, b"HELLO TAPE").unwrap();
    let wav = tmp_path("roundtrip.wav");
    let back = tmp_path("roundtrip_out.bin");

    let (ok, text) = run_tapewave(&[
        "convert",
        "--baud",
        "1",
        "--name",
        "RT",
        input.to_str().unwrap(),
        wav.to_str().unwrap(),
    ]);
    assert!(ok, "encode failed: {}", text);
    assert!(wav.exists(), "wav file was not created");
    // sections plus the trailing carrier, a fraction of a second of audio
    assert!(fs::metadata(&wav).unwrap().len() > 10_000);

    let (ok, text) = run_tapewave(&[
        "convert",
        wav.to_str().unwrap(),
        back.to_str().unwrap(),
    ]);
    assert!(ok, "decode failed: {}", text);
    assert_eq!(fs::read(&back).unwrap(), b"HELLO TAPE");
    assert!(text.contains("dataname: \"RT"), "missing report: {}", text);
}

#[test]
fn test_convert_real_to_t9x() {
    let input = tmp_path("image.bin");
    fs::write(&input, b"T9X PAYLOAD").unwrap();
    let t9x = tmp_path("image.t9x");

    let (ok, text) = run_tapewave(&[
        "convert",
        "--baud",
        "1",
        input.to_str().unwrap(),
        t9x.to_str().unwrap(),
    ]);
    assert!(ok, "conversion failed: {}", text);

    let bytes = fs::read(&t9x).unwrap();
    assert_eq!(&bytes[..32], b"eMB-689X CassetteTapeImageFile  ");
}

#[test]
fn test_rejects_converting_a_file_onto_itself() {
    let input = tmp_path("inplace.bin");
    fs::write(&input, b"KEEP ME").unwrap();

    let (ok, text) = run_tapewave(&[
        "convert",
        input.to_str().unwrap(),
        input.to_str().unwrap(),
    ]);
    assert!(!ok, "in-place conversion must fail: {}", text);
    assert!(text.contains("same file"), "{}", text);
    assert_eq!(fs::read(&input).unwrap(), b"KEEP ME");
}

#[test]
fn test_rejects_unknown_subcommand() {
    let (ok, text) = run_tapewave(&["modulate"]);
    assert!(!ok);
    assert!(text.contains("Usage") || text.contains("error"), "{}", text);
}
