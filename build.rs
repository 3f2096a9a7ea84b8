use std::process::Command;

fn main() {
    // Release images have no .git; they pass SIGNALWATCH_GIT_SHA instead.
    let git_sha = std::env::var("SIGNALWATCH_GIT_SHA")
        .ok()
        .filter(|sha| !sha.is_empty())
        .or_else(|| {
            Command::new("git")
                .args(["rev-parse", "--short", "HEAD"])
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_SHA={git_sha}");
    println!("cargo:rerun-if-env-changed=SIGNALWATCH_GIT_SHA");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
