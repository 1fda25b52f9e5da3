//! Cryptographic primitives
//!
//! ChaCha20-Poly1305 sealed frames keyed by the pre-shared key (aead).

pub mod aead;

pub use aead::SealCodec;
