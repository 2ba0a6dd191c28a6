//! Build script for stackcrawl-core
//!
//! This script checks the toolchain and picks the native cache-entry layout:
//! - Minimum Rust version (Edition 2021 = Rust 1.56.0+)
//! - `x86` targets pack entries with the frame-pointer layout
//! - `x86_64` targets pack entries with the windowed layout
//! - Every other architecture gets the no-cache layout
//!
//! The choice is exported as `cfg(stackcrawl_layout = "...")` so the hot path
//! never branches on architecture at runtime.

fn main()
{
    println!("cargo::rustc-check-cfg=cfg(stackcrawl_layout, values(\"frame_pointer\", \"windowed\", \"none\"))");
    println!("cargo:rerun-if-changed=build.rs");

    // Edition 2021 requires Rust 1.56.0
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 56, 0);

        if rustc_version < min_rust_version {
            panic!(
                "stackcrawl-core requires Rust {} or newer (Edition 2021), found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    // CARGO_CFG_TARGET_ARCH describes the target, not the host running this script.
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let layout = match arch.as_str() {
        "x86" => "frame_pointer",
        "x86_64" => "windowed",
        _ => "none",
    };

    println!("cargo:rustc-cfg=stackcrawl_layout=\"{layout}\"");
}
