use std::env;
use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Utc};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

fn main() {
    println!("cargo:rerun-if-env-changed=CALLBACK_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // Build scripts run from the crate directory, so ask git where the
    // repository lives instead of assuming `.git` sits next to us.
    let git_dir = git(&["rev-parse", "--absolute-git-dir"]).map(PathBuf::from);
    if let Some(dir) = &git_dir {
        println!("cargo:rerun-if-changed={}", dir.join("HEAD").display());
        println!("cargo:rerun-if-changed={}", dir.join("index").display());
    }

    let build_time = build_time().format(TIME_FORMAT).to_string();
    let git_label = git_dir
        .and_then(|_| git(&["describe", "--tags", "--dirty", "--always"]))
        .unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("CALLBACK_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("{build_time} | {git_label}"));

    println!("cargo:rustc-env=CALLBACK_BUILD_ID={build_id}");
    println!("cargo:rustc-env=CALLBACK_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=CALLBACK_BUILD_GIT={git_label}");
}

/// Honours `SOURCE_DATE_EPOCH` so packaged builds are reproducible.
fn build_time() -> DateTime<Utc> {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!out.is_empty()).then_some(out)
}
