//! Full path: toolchain -> forwarder link -> router -> sandboxed guest.
#![cfg(unix)]

use std::path::{Path, PathBuf};

use wacro_host::{LinkFarm, ToolchainInvocation, route_toolchain};
use wacro_proto::encode;
use wacro_sandbox::SandboxConfig;

const FORWARDER: &str = env!("CARGO_BIN_EXE_wacro-forwarder");
const ECHO: &str = include_str!("../../wacro-sandbox/tests/fixtures/echo.wat");
const REVERSE: &str = include_str!("../../wacro-sandbox/tests/fixtures/reverse.wat");

/// Write a fixture under a `.wasm` name so the toolchain rewrite picks it up.
fn module(dir: &Path, name: &str, wat: &str) -> PathBuf {
    let path = dir.join(format!("{name}.wasm"));
    std::fs::write(&path, wat).unwrap();
    path
}

/// Drive `invocation` with each plugin served by an in-process runner.
async fn route(invocation: &ToolchainInvocation) -> std::process::ExitStatus {
    let links = LinkFarm::create(Path::new(FORWARDER), invocation.plugins().len()).unwrap();
    let handlers: Vec<_> = invocation
        .load_plugins(&SandboxConfig::default())
        .unwrap()
        .into_iter()
        .map(|mut vm| move |request: &[u8]| vm.call_bytes(request))
        .collect();
    route_toolchain(invocation, &links, handlers).await.unwrap()
}

#[tokio::test]
async fn toolchain_reaches_guest_through_forwarder() {
    let dir = tempfile::tempdir().unwrap();
    let echo = module(dir.path(), "Echo", ECHO);
    let requests = dir.path().join("requests.bin");
    let responses = dir.path().join("responses.bin");

    let mut input = encode(b"{}");
    input.extend(encode(br#"{"expandMacro":{"name":"stringify"}}"#));
    std::fs::write(&requests, &input).unwrap();

    // $2 is the rewritten plugin argument: <links>/1#Echo
    let invocation = ToolchainInvocation::parse([
        "sh".to_owned(),
        "-c".to_owned(),
        r#"p="${2%%#*}"; "$p" < "$3" > "$4""#.to_owned(),
        "toolchain".to_owned(),
        "-load-plugin-executable".to_owned(),
        format!("{}#Echo", echo.display()),
        requests.display().to_string(),
        responses.display().to_string(),
    ])
    .unwrap();

    let status = route(&invocation).await;
    assert!(status.success());
    assert_eq!(std::fs::read(&responses).unwrap(), input);
}

#[tokio::test]
async fn each_link_reaches_its_own_slot() {
    let dir = tempfile::tempdir().unwrap();
    let echo = module(dir.path(), "Echo", ECHO);
    let reverse = module(dir.path(), "Reverse", REVERSE);
    let requests = dir.path().join("requests.bin");
    let out_echo = dir.path().join("echo.bin");
    let out_reverse = dir.path().join("reverse.bin");
    std::fs::write(&requests, encode(b"abc")).unwrap();

    let script = r#"
        a="${2%%#*}"; b="${4%%#*}"
        "$b" < "$5" > "$7" &&
        "$a" < "$5" > "$6"
    "#;
    let invocation = ToolchainInvocation::parse([
        "sh".to_owned(),
        "-c".to_owned(),
        script.to_owned(),
        "toolchain".to_owned(),
        "-load-plugin-executable".to_owned(),
        format!("{}#Echo", echo.display()),
        "-load-plugin-executable".to_owned(),
        format!("{}#Reverse", reverse.display()),
        requests.display().to_string(),
        out_echo.display().to_string(),
        out_reverse.display().to_string(),
    ])
    .unwrap();

    let status = route(&invocation).await;
    assert!(status.success());
    assert_eq!(std::fs::read(&out_echo).unwrap(), encode(b"abc"));
    assert_eq!(std::fs::read(&out_reverse).unwrap(), encode(b"cba"));
}

#[test]
fn stub_started_under_another_name_fails_silently() {
    let output = std::process::Command::new(FORWARDER)
        .stdin(std::process::Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());
}
