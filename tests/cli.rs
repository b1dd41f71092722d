use std::process::Command;

#[test]
fn server_exits_non_zero_when_configuration_is_invalid() {
    let output = Command::new(env!("CARGO_BIN_EXE_tidemq"))
        .arg("server")
        .env("TIDEMQ__SERVER__PORT", "notaport")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run tidemq");

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Failed to load configuration"),
        "nothing was logged: {stdout}"
    );
}
