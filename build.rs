//! Build script for devmem
//!
//! Reads compile-time configuration from environment variables:
//! - DEVMEM_DEFAULT_PATH: physical-memory device opened by default (default: /dev/mem)
//! - DEVMEM_STRICT_ALIGNMENT: round every access down to its natural alignment
//!   (set to `1` or `true` for targets that fault on misaligned accesses)

fn main() {
    let path = std::env::var("DEVMEM_DEFAULT_PATH").unwrap_or_else(|_| "/dev/mem".to_string());
    if path.is_empty() {
        panic!("DEVMEM_DEFAULT_PATH must not be empty");
    }

    let strict = std::env::var("DEVMEM_STRICT_ALIGNMENT")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    println!("cargo:rustc-env=DEVMEM_DEFAULT_PATH={}", path);

    println!("cargo:rustc-check-cfg=cfg(strict_alignment)");
    if strict {
        println!("cargo:rustc-cfg=strict_alignment");
    }

    // Rebuild if these change
    println!("cargo:rerun-if-env-changed=DEVMEM_DEFAULT_PATH");
    println!("cargo:rerun-if-env-changed=DEVMEM_STRICT_ALIGNMENT");
}
