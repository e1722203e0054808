//! Build script for greenbridge-plugin
//!
//! Records the target triple, host triple and optimization level of this
//! build so the compile step can hand the same values to `cc` at run time,
//! outside of any build script.

use std::env;

fn main() {
    for key in ["TARGET", "HOST", "OPT_LEVEL"] {
        let value = env::var(key).unwrap_or_default();
        println!("cargo:rustc-env=GB_BUILD_{}={}", key, value);
    }
    println!("cargo:rerun-if-changed=build.rs");
}
