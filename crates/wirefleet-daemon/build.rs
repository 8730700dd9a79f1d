use std::process::Command;

fn main() {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_VERSION={}", output);
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    // PROFILE only reports debug/release, so custom profiles are detected
    // from the output directory.
    let distribute = std::env::var("PROFILE").as_deref() == Ok("distribute")
        || std::env::var("OUT_DIR").is_ok_and(|dir| dir.contains("/distribute/"));
    if distribute {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
}
