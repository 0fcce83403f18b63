// Cryptography module — password-derived message encryption

pub mod password;

pub use password::{
    decrypt, derive_key, encrypt, generate_password, is_cipher_payload, parse_cipher_payload,
    sha256_hex, CipherPayload, CryptoError,
};
