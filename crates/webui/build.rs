//! Stamps the build timestamp into the binary for `/api/sysinfo`, since
//! there is no reliable way to recover it from a running process otherwise.

use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=COOLER_BUILD_EPOCH={secs}");
}
