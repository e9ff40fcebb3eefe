use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn cmd_stdout(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // SOURCE_DATE_EPOCH wins so packaged builds stay reproducible.
    let build_time = match env::var("SOURCE_DATE_EPOCH") {
        Ok(sde) => format!("epoch:{sde}"),
        Err(_) => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            format!("epoch:{secs}")
        }
    };

    let build_host = env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| cmd_stdout("hostname", &[]))
        .unwrap_or_else(|| "unknown".to_string());

    let build_rev = cmd_stdout("git", &["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "-".to_string());

    println!("cargo:rustc-env=DESKWATCH_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=DESKWATCH_BUILD_HOST={build_host}");
    println!("cargo:rustc-env=DESKWATCH_BUILD_REV={build_rev}");
}
