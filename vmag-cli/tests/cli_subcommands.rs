use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("vmag_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn vmag() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vmag"));
    cmd.env("RUST_LOG", "off");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("stdout is not a JSON object: {e}\n{stdout}"))
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = vmag().arg("help").output().expect("run vmag help");

    assert!(
        output.status.success(),
        "vmag help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("magnify"), "missing magnify in help output");
    assert!(stdout.contains("synth"), "missing synth in help output");
    assert!(stdout.contains("validate"), "missing validate in help output");
}

#[test]
fn magnify_help_lists_band_and_region_flags() {
    let output = vmag()
        .args(["magnify", "--help"])
        .output()
        .expect("run vmag magnify --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--roi",
        "--gain",
        "--f-min",
        "--f-max",
        "--depth",
        "--config",
        "--memory-limit-mib",
        "--progress",
        "--json",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in magnify help");
    }
}

#[test]
fn validate_json_reports_coefficients() {
    let dir = unique_temp_dir("validate");
    let job = dir.join("job.json");
    fs::write(
        &job,
        r#"{"schema_version":1,"roi":{"x":8,"y":8,"width":32,"height":32},"params":{"gain":20.0}}"#,
    )
    .expect("write job");

    let output = vmag()
        .args(["validate", "--config"])
        .arg(&job)
        .args(["--width", "64", "--height", "64", "--json"])
        .output()
        .expect("run vmag validate");

    assert!(
        output.status.success(),
        "validate failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "validate");
    assert_eq!(value["ok"], true);
    assert_eq!(value["geometry_checked"], true);
    assert_eq!(value["params"]["gain"], 20.0);
    assert_eq!(value["params"]["pyramid_depth"], 3);
    let (lo, hi) = (
        value["alpha_low"].as_f64().expect("alpha_low"),
        value["alpha_high"].as_f64().expect("alpha_high"),
    );
    assert!(0.0 < hi && hi < lo && lo < 1.0);
}

#[test]
fn validate_rejects_schema_mismatch_with_config_exit_code() {
    let dir = unique_temp_dir("validate_schema");
    let job = dir.join("job.json");
    fs::write(&job, r#"{"schema_version":2}"#).expect("write job");

    let output = vmag()
        .args(["validate", "--json", "--config"])
        .arg(&job)
        .output()
        .expect("run vmag validate");

    assert_eq!(output.status.code(), Some(105));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["kind"], "configuration");
    assert!(
        value["error"]
            .as_str()
            .unwrap_or_default()
            .contains("Job schema mismatch")
    );
}

#[test]
fn validate_rejects_region_outside_frame() {
    let dir = unique_temp_dir("validate_roi");
    let job = dir.join("job.json");
    fs::write(
        &job,
        r#"{"schema_version":1,"roi":{"x":60,"y":0,"width":8,"height":8}}"#,
    )
    .expect("write job");

    let output = vmag()
        .args(["validate", "--json", "--width", "64", "--height", "64", "--config"])
        .arg(&job)
        .output()
        .expect("run vmag validate");

    assert_eq!(output.status.code(), Some(100));
    assert_eq!(stdout_json(&output)["ok"], false);
}

#[test]
fn synth_json_measures_amplitude_within_tolerance() {
    let output = vmag()
        .args(["synth", "--json", "--progress", "off"])
        .output()
        .expect("run vmag synth");

    assert!(
        output.status.success(),
        "synth failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "synth");
    assert_eq!(value["within_tolerance"], true);
    assert_eq!(value["report"]["frames"], 90);
    assert_eq!(value["report"]["clamped_samples"], 0);
    let measured = value["measured_amplitude"].as_f64().expect("measured");
    let expected = value["expected_amplitude"].as_f64().expect("expected");
    assert!((measured - expected).abs() <= 0.15 * expected);
}

#[test]
fn synth_outside_tolerance_exits_non_zero() {
    // Gain 100 drives the pixel far past [0, 1]; clamping caps the
    // measured amplitude well below the expected one.
    let output = vmag()
        .args(["synth", "--json", "--progress", "off", "--gain", "100"])
        .output()
        .expect("run vmag synth");

    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "synth");
    assert_eq!(value["ok"], false);
    assert_eq!(value["within_tolerance"], false);
    assert!(value["report"]["clamped_samples"].as_u64().expect("clamped") > 0);
}

#[test]
fn magnify_writes_output_of_same_size() {
    let dir = unique_temp_dir("magnify");
    let input = dir.join("in.gray");
    let out = dir.join("out.gray");
    let frame = 16 * 16;
    let data: Vec<u8> = (0..frame * 12).map(|i| (64 + (i * 37) % 128) as u8).collect();
    fs::write(&input, &data).expect("write input");

    let output = vmag()
        .args(["magnify", "--width", "16", "--height", "16", "--roi", "4,4,8,8", "--depth", "2"])
        .args(["--json", "--progress", "off", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(&out)
        .output()
        .expect("run vmag magnify");

    assert!(
        output.status.success(),
        "magnify failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], true);
    assert_eq!(value["report"]["frames"], 12);
    assert_eq!(value["report"]["roi"]["x"], 4);

    let written = fs::read(&out).expect("read output");
    assert_eq!(written.len(), data.len());
    // Row 0 lies outside the region and passes through untouched.
    assert_eq!(written[..16], data[..16]);
}

#[test]
fn magnify_rejects_truncated_input() {
    let dir = unique_temp_dir("magnify_truncated");
    let input = dir.join("in.gray");
    fs::write(&input, [0u8; 100]).expect("write input");

    let output = vmag()
        .args(["magnify", "--width", "8", "--height", "8", "--json", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(dir.join("out.gray"))
        .output()
        .expect("run vmag magnify");

    assert_eq!(output.status.code(), Some(104));
    let value = stdout_json(&output);
    assert_eq!(value["command"], "magnify");
    assert_eq!(value["ok"], false);
    assert!(!dir.join("out.gray").exists());
}
