//! Generates foreign bindings for `sealkv_core` built with the `ffi` feature.
//!
//! ```sh
//! cargo build -p sealkv-core --features ffi --release
//! cargo run -p uniffi-bindgen -- generate --library \
//!     target/release/libsealkv_core.so --language swift --out-dir swift
//! ```

fn main() {
    uniffi::uniffi_bindgen_main();
}
