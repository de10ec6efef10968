//! Signed binary export of key batches (protobuf + zip + ECDSA).

pub mod proto;
pub mod signer;

pub use signer::{
    load_or_generate_signing_key, BatchSigner, ExportError, SignedBatch, SignatureScheme,
    SignerConfig, EXPORT_MAGIC, OID_ECDSA_SHA256,
};
