use std::process::Command;

fn zdbg() -> Command {
    Command::new(env!("CARGO_BIN_EXE_zdbg"))
}

#[test]
fn test_cli_help() {
    let output = zdbg().arg("--help").output().expect("Failed to run zdbg");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: zdbg"));
    assert!(stdout.contains("shell"));
}

#[test]
fn test_simulator_run_to_breakpoint() {
    let program = std::env::temp_dir().join(format!("zdbg-cli-{}.bin", std::process::id()));
    // LD A,0x2A; NOP; HALT
    std::fs::write(&program, [0x3E, 0x2A, 0x00, 0x76]).unwrap();

    let output = zdbg()
        .arg("--program")
        .arg(&program)
        .args(["run", "--break", "8002"])
        .output()
        .expect("Failed to run zdbg");
    std::fs::remove_file(&program).unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Stopped: breakpoint hit at 0x8002"));
    assert!(stdout.contains("PC=8002"));
    assert!(stdout.contains("AF=2A"));
}

#[test]
fn test_json_output() {
    let output = zdbg().args(["--json", "regs"]).output().expect("Failed to run zdbg");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().find(|l| l.contains("\"registers\"")).expect("no registers event");
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(value["data"]["pc"], 0x8000);
}

#[test]
fn test_program_rejected_for_network_backend() {
    let output = zdbg().args(["--backend", "mame", "--program", "x.bin", "regs"]).output().expect("Failed to run zdbg");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--program is only supported by the simulator"));
}
