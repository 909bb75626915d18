//! Payload protection: field-level encryption of sensitive event data.

pub mod codec;
pub mod encryption;
pub mod predicate;

pub use codec::{CodecError, DecryptFailure, DecryptOutcome, SensitiveFieldCodec};
pub use encryption::{AesCtrHmacEncryption, CIPHERTEXT_PREFIX, CryptoError, EncryptionService};
pub use predicate::{FieldPredicate, default_predicates};
