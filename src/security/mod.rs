//! Transport security: public key pinning.

pub mod pinning;

pub use pinning::{spki_hash, spki_hash_of, PinSet, PinStore, SpkiHash};
