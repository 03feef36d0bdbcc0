use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=APPGATE_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-env-changed=APPGATE_RELEASE_CHANNEL");

    if let Some(path) = git_head_ref() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());
    let channel = env::var("APPGATE_RELEASE_CHANNEL").unwrap_or_else(|_| "dev".to_string());

    let build_id = match env::var("APPGATE_BUILD_ID_OVERRIDE") {
        Ok(id) if !id.trim().is_empty() => id,
        _ => format!("{channel}+{revision} ({build_time})"),
    };

    println!("cargo:rustc-env=APPGATE_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=APPGATE_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=APPGATE_BUILD_REVISION={}", revision);
    println!("cargo:rustc-env=APPGATE_BUILD_CHANNEL={}", channel);
}

/// Walks up from the crate directory to the first `.git/HEAD` and returns the
/// file that moves when a new commit lands.
fn git_head_ref() -> Option<String> {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").ok()?;
    let git_dir = Path::new(&manifest_dir)
        .ancestors()
        .map(|dir| dir.join(".git"))
        .find(|candidate| candidate.join("HEAD").is_file())?;

    let head = git_dir.join("HEAD");
    let reference = fs::read_to_string(&head).ok()?;
    match reference.strip_prefix("ref: ") {
        Some(name) => {
            let target = git_dir.join(name.trim());
            let watched = if target.exists() { target } else { head };
            Some(watched.display().to_string())
        }
        None => Some(head.display().to_string()),
    }
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if revision.is_empty() {
        return None;
    }

    let dirty = Command::new("git")
        .args(["status", "--porcelain", "--untracked-files=no"])
        .output()
        .ok()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false);

    Some(if dirty {
        format!("{revision}-dirty")
    } else {
        revision
    })
}
