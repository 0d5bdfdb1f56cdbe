//! Spawning a toolchain with slot pipes on their fixed descriptors.
#![cfg(unix)]

use wacro_host::{LinkFarm, ToolchainInvocation, route_toolchain};
use wacro_proto::encode;
use wacro_sandbox::SandboxError;

fn reverse(request: &[u8]) -> Result<Vec<u8>, SandboxError> {
    Ok(request.iter().rev().copied().collect())
}

fn forwarder_stand_in(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("forwarder");
    std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
    path
}

/// The "toolchain" writes one frame per slot on `3 + 2i` and copies the
/// reply from `4 + 2i` into a file, standing in for a compiler that talks
/// to its plugins.
#[tokio::test]
async fn toolchain_sees_slot_pipes_on_fixed_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let out0 = dir.path().join("slot0.bin");
    let out1 = dir.path().join("slot1.bin");

    let script = format!(
        "printf '\\002\\000\\000\\000\\000\\000\\000\\000ab' >&3; exec 3>&-; \
         printf '\\002\\000\\000\\000\\000\\000\\000\\000cd' >&5; exec 5>&-; \
         head -c 10 <&4 > '{}'; head -c 10 <&6 > '{}'",
        out0.display(),
        out1.display()
    );
    let invocation = ToolchainInvocation::parse([
        "sh",
        "-c",
        script.as_str(),
        "toolchain",
        "-load-plugin-executable",
        "first.wasm#First",
        "-load-plugin-executable",
        "second.wasm#Second",
    ])
    .unwrap();
    assert_eq!(invocation.plugins().len(), 2);

    let links = LinkFarm::create(&forwarder_stand_in(dir.path()), 2).unwrap();
    let status = route_toolchain(&invocation, &links, vec![reverse, reverse])
        .await
        .unwrap();

    assert!(status.success());
    assert_eq!(std::fs::read(&out0).unwrap(), encode(b"ba"));
    assert_eq!(std::fs::read(&out1).unwrap(), encode(b"dc"));
}

#[tokio::test]
async fn toolchain_exit_code_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let invocation = ToolchainInvocation::parse([
        "sh",
        "-c",
        "exit 7",
        "toolchain",
        "-load-plugin-executable",
        "only.wasm",
    ])
    .unwrap();
    let links = LinkFarm::create(&forwarder_stand_in(dir.path()), 1).unwrap();

    let status = route_toolchain(&invocation, &links, vec![reverse]).await.unwrap();
    assert_eq!(status.code(), Some(7));
}

#[tokio::test]
async fn missing_toolchain_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let invocation =
        ToolchainInvocation::parse(["/nonexistent/swiftc", "-load-plugin-executable", "a.wasm"])
            .unwrap();
    let links = LinkFarm::create(&forwarder_stand_in(dir.path()), 1).unwrap();

    let err = route_toolchain(&invocation, &links, vec![reverse])
        .await
        .unwrap_err();
    assert!(matches!(err, wacro_host::HostError::Toolchain(_)));
}
