// build.rs - Build-time metadata for tempsim
//
// Records the build timestamp and compiler version read back by
// `tempsim::BUILD_TIMESTAMP` and `tempsim::RUST_VERSION`.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");

    println!(
        "cargo:rustc-env=TEMPSIM_BUILD_TIMESTAMP={}",
        chrono::Utc::now().to_rfc3339()
    );

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=TEMPSIM_RUST_VERSION={}", rustc_version);
}
