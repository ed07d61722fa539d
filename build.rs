use std::process::Command;

/// Trimmed stdout of a git command, if git is available and succeeds
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}

fn main() {
    let hash = git(&["rev-parse", "--short", "HEAD"])
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let dirty = git(&["status", "--porcelain"]).is_some_and(|s| !s.is_empty());

    // Reported in the controller handshake and `--version`: v0.3.2 (abc1234)
    let suffix = if dirty { "-dev" } else { "" };
    let version = format!("v{}{} ({})", env!("CARGO_PKG_VERSION"), suffix, hash);

    println!("cargo:rustc-env=LIVEDEBUG_GIT_HASH={}", hash);
    println!("cargo:rustc-env=LIVEDEBUG_VERSION={}", version);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-changed=Cargo.toml");
}
