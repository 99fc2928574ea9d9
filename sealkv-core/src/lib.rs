//! `sealkv_core` is an encrypted at-rest key-value store.
//!
//! Values are encrypted with `XChaCha20-Poly1305` under a master key that is
//! sealed by the platform's secure-credential subsystem (Keychain, Android
//! Keystore, or a development key file). Writes are crash-safe, `clear` and
//! key rotation are atomic, and the store can report whether the device has a
//! lock-screen credential without ever unsealing the key.
//!
//! The entry point is [`EncryptedStorage`].

#![deny(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]

pub mod cipher;
pub mod config;
pub mod error;
pub mod lock;
pub mod logger;
pub mod paths;
pub mod persistence;
pub mod platform;
pub mod probe;
pub mod store;
pub mod vault;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use config::{CredentialPolicy, StoreConfig};
pub use error::{ErrorKind, PlatformError, StorageError, StorageResult};
pub use probe::DeviceStateProbe;
pub use store::EncryptedStorage;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("sealkv_core");
