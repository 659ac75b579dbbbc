// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=CAMHUB_VERSION");

    // Packagers pin the version explicitly
    let version = std::env::var("CAMHUB_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(git_version)
        .unwrap_or_else(|| std::env::var("CARGO_PKG_VERSION").unwrap_or_default());

    println!("cargo::rustc-env=CAMHUB_BUILD_VERSION={}", version);
}

/// "0.2.0" on a tag, "0.2.0-3-gabc1234" after it, the short hash without tags
fn git_version() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--match", "v*"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let described = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if described.is_empty() {
        return None;
    }
    Some(described.strip_prefix('v').unwrap_or(&described).to_string())
}
