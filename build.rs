use std::process::Command;

/// Stamp `dnsexfil --version` with the commit and build date
fn main() {
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();

    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!(
        "cargo:rustc-env=DNSEXFIL_VERSION={} ({} {})",
        env!("CARGO_PKG_VERSION"),
        commit,
        date
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
