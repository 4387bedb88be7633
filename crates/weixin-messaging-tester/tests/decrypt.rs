use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::{fs, path::PathBuf};
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn sealed_body() -> Result<String, Box<dyn std::error::Error>> {
    let output = cargo_bin_cmd!("weixin-messaging-tester")
        .arg("query")
        .arg("--values")
        .arg(fixture("values/weixin.json"))
        .arg("--xml")
        .arg(fixture("text_message.xml"))
        .arg("--encrypt-type")
        .arg("aes")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: Value = serde_json::from_slice(&output)?;
    Ok(parsed["body"].as_str().unwrap_or_default().to_string())
}

#[test]
fn decrypt_prints_inner_message() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = tempdir()?;
    let body_path = tempdir.path().join("envelope.xml");
    fs::write(&body_path, sealed_body()?)?;

    let output = cargo_bin_cmd!("weixin-messaging-tester")
        .arg("decrypt")
        .arg("--values")
        .arg(fixture("values/weixin.json"))
        .arg("--body")
        .arg(&body_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: Value = serde_json::from_slice(&output)?;
    assert_eq!(parsed["app_id"], "wxc107bb57144a5test");
    assert_eq!(parsed["message"]["FromUserName"], "diaosi");
    assert_eq!(parsed["message"]["Content"], "测试中");
    assert_eq!(parsed["message"]["MsgId"], "5837397576500011341");
    Ok(())
}

#[test]
fn decrypt_without_key_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = tempdir()?;
    let body_path = tempdir.path().join("envelope.xml");
    fs::write(&body_path, sealed_body()?)?;

    cargo_bin_cmd!("weixin-messaging-tester")
        .arg("decrypt")
        .arg("--values")
        .arg(fixture("values/weixin_plain.json"))
        .arg("--body")
        .arg(&body_path)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("no encoding key"));
    Ok(())
}

#[test]
fn decrypt_requires_encrypt_element() {
    cargo_bin_cmd!("weixin-messaging-tester")
        .arg("decrypt")
        .arg("--values")
        .arg(fixture("values/weixin.json"))
        .arg("--body")
        .arg(fixture("text_message.xml"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("has no Encrypt element"));
}
