//! Build script for the messenger node
//!
//! Embeds build-time information into the binary so `messenger-node version`
//! can report exactly what is running on a peer.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(output) if output.status.success() => {
            if output.stdout.is_empty() { "false" } else { "true" }
        }
        _ => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = command_output("rustc", &["--version"]);

    println!("cargo:rustc-env=MESSENGER_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=MESSENGER_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=MESSENGER_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=MESSENGER_TARGET={}", target);
    println!("cargo:rustc-env=MESSENGER_PROFILE={}", profile);
    println!("cargo:rustc-env=MESSENGER_RUSTC_VERSION={}", rustc_version);
}

fn git(args: &[&str]) -> String {
    command_output("git", args)
}

/// Run a command and return its trimmed stdout, or "unknown" on any failure
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
