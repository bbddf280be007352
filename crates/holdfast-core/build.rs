//! Build script for holdfast-core
//!
//! Checks the toolchain before compilation. The crate relies on
//! `Option::is_some_and` and `usize::div_ceil`, so Rust 1.73.0 is the oldest
//! compiler that can build it.
//!
//! The script also reports which hardware architecture the agent will name
//! registers for. Unsupported architectures still build, but only the common
//! `pc`/`sp`/`fp` registers are addressable on them.

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match rustc_version::version() {
        Ok(found) => {
            let minimum = rustc_version::Version::new(1, 73, 0);
            if found < minimum {
                println!("cargo:warning=holdfast-core requires Rust {minimum} or newer, found {found}");
                std::process::exit(1);
            }
        }
        // Some build environments hide rustc; don't fail the build over it.
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if !matches!(arch.as_str(), "aarch64" | "x86_64") {
        println!("cargo:warning=holdfast-core: no register layout for target arch {arch:?}, only pc/sp/fp are available");
    }
}
