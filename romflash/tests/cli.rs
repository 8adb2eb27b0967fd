use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions
use std::process::Command; // Run programs

#[test]
fn help_lists_subcommands() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("romflash")?;

    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("write-bin"))
        .stdout(predicate::str::contains("erase-region"))
        .stdout(predicate::str::contains("reset"));

    Ok(())
}

#[test]
fn missing_image_fails_before_connecting() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("romflash")?;

    cmd.env_remove("ROMFLASH_PORT")
        .env("NO_COLOR", "1")
        .args(["write-bin", "0x1000", "does-not-exist.bin", "--port", "/dev/romflash-test"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open image"));

    Ok(())
}

#[test]
fn invalid_address_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("romflash")?;

    cmd.env_remove("ROMFLASH_PORT")
        .args(["erase-region", "0xZZ", "0x1000", "--port", "/dev/romflash-test"]);
    cmd.assert().failure().code(2);

    Ok(())
}

#[test]
fn port_is_required() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("romflash")?;

    cmd.env_remove("ROMFLASH_PORT").args(["reset"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--port"));

    Ok(())
}
