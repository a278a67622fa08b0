use std::process::Command;

#[test]
fn cargo_test_protocol() {
    assert!(Command::new(env!("CARGO"))
        .arg("test")
        .arg("-p")
        .arg("minikernel-protocol")
        .status()
        .unwrap()
        .success());
}
