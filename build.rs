use std::env;
use std::process::Command;

fn main() {
    // An explicit GIT_COMMIT (release builds) wins over the local checkout.
    if let Ok(commit) = env::var("GIT_COMMIT") {
        println!("cargo:rustc-env=GIT_COMMIT={commit}");
        println!("cargo:rerun-if-env-changed=GIT_COMMIT");
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        _ => println!("cargo:warning=git commit unavailable, version will report unknown"),
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
