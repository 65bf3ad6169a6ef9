//! Build script for streaming-attn-ctx.
//!
//! No FFI or native compilation step remains in this crate — the
//! external attention primitive and rotary embedding are Rust trait
//! objects (see `src/attn`), not an FFI boundary. Kept as a file because
//! the rest of the crate's layout follows a teacher that always ships
//! one, but emptied of the CUDA/llama.cpp compile steps that no longer
//! apply.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
