// build.rs

use std::env;

fn main() {
    // Release pipelines stamp the binary through SPINELCHAT_VERSION; local builds
    // fall back to the crate version.
    let version = env::var("SPINELCHAT_VERSION")
        .unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "dev".to_string()));

    println!("cargo:rustc-env=SPINELCHAT_BUILD_VERSION={version}");
    println!("cargo:rerun-if-env-changed=SPINELCHAT_VERSION");
}
