mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("settlement-desk"));
    cmd.arg("--users")
        .arg("tests/fixtures/users.csv")
        .arg("--requests")
        .arg("tests/fixtures/requests.csv")
        .arg("tests/fixtures/actions.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("user,balance"))
        // Trade approved: credited
        .stdout(predicate::str::contains("1,5000"))
        // Withdrawal over balance: untouched
        .stdout(predicate::str::contains("2,1000"))
        // Withdrawal approved once despite the repeated action
        .stdout(predicate::str::contains("3,600"))
        .stderr(predicate::str::contains("Error settling request 2: insufficient balance"))
        .stderr(predicate::str::contains(
            "Error settling request 3: request 3 already settled as approved",
        ))
        .stderr(predicate::str::contains("Error settling request 99: request 99 not found"));

    Ok(())
}

#[test]
fn test_cli_requests_report() {
    let dir = tempdir().unwrap();
    let users = dir.path().join("users.csv");
    let requests = dir.path().join("requests.csv");
    let actions = dir.path().join("actions.csv");
    let report = dir.path().join("report.csv");
    common::write_users(&users, &[(7, "10.50")]).unwrap();
    common::write_requests(
        &requests,
        &[(1, "withdrawal", 7, "10.5"), (2, "trade", 7, "4"), (3, "trade", 7, "1")],
    )
    .unwrap();
    common::write_actions(&actions, &[("approve", 1), ("reject", 2)]).unwrap();

    let mut cmd = Command::new(cargo_bin!("settlement-desk"));
    cmd.arg("--users")
        .arg(&users)
        .arg("--requests")
        .arg(&requests)
        .arg("--requests-report")
        .arg(&report)
        .arg(&actions);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("7,0"))
        .stderr(predicate::str::contains("Error").not());

    let written = std::fs::read_to_string(&report).unwrap();
    assert!(written.starts_with("request,kind,user,amount,status"));
    assert!(written.contains("1,withdrawal,7,10.5,approved"));
    assert!(written.contains("2,trade,7,4,rejected"));
    assert!(written.contains("3,trade,7,1,pending"));
}

#[test]
fn test_cli_reports_malformed_rows_and_continues() {
    let dir = tempdir().unwrap();
    let users = dir.path().join("users.csv");
    let requests = dir.path().join("requests.csv");
    let actions = dir.path().join("actions.csv");
    common::write_users(&users, &[(1, "0")]).unwrap();
    common::write_requests(&requests, &[(1, "refund", 1, "5"), (2, "trade", 1, "5")]).unwrap();
    common::write_actions(&actions, &[("pending", 2), ("approve", 2)]).unwrap();

    let mut cmd = Command::new(cargo_bin!("settlement-desk"));
    cmd.arg("--users")
        .arg(&users)
        .arg("--requests")
        .arg(&requests)
        .arg(&actions);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1,5"))
        .stderr(predicate::str::contains("Error reading request"))
        .stderr(predicate::str::contains("Error reading action"));
}

#[test]
fn test_cli_missing_actions_file_fails() {
    let mut cmd = Command::new(cargo_bin!("settlement-desk"));
    cmd.arg("does/not/exist.csv");

    cmd.assert().failure();
}
