//! Serializes key batches into the versioned binary export format, signs
//! them with the server's ECDSA key, and packages archive responses.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Duration;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use prost::Message;
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::clock::INTERVAL_SECS;
use crate::export::proto::{v1, v2};
use crate::model::ExposureKey;

/// Fixed header identifying the export format: "EK Export v1    ".
pub const EXPORT_MAGIC: [u8; 16] = *b"EK Export v1    ";

/// OID of ECDSA with SHA-256, the only scheme clients accept today.
pub const OID_ECDSA_SHA256: &str = "1.2.840.10045.4.3.2";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot export an empty key batch")]
    EmptyBatch,
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("stored key data is not valid base64")]
    InvalidKeyData,
    #[error("signing failed: {0}")]
    Signature(#[from] p256::ecdsa::signature::Error),
    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The concrete signature scheme behind an OID-style algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    EcdsaP256Sha256,
}

impl SignatureScheme {
    pub fn from_oid(oid: &str) -> Result<Self, ExportError> {
        match oid.trim() {
            OID_ECDSA_SHA256 => Ok(SignatureScheme::EcdsaP256Sha256),
            other => Err(ExportError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Static signer configuration; values end up in the embedded
/// `SignatureInfo` so clients can select the matching public key.
#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub algorithm: String,
    pub app_bundle_id: String,
    pub apk_package: String,
    pub key_version: String,
    pub key_verification_id: String,
    pub region: String,
}

/// A signed, zipped key batch plus the digest callers use for response
/// caching (SHA-256 over `export.bin` and the server's public key encoding).
pub struct SignedBatch {
    pub hash: Vec<u8>,
    pub zip: Vec<u8>,
}

pub struct BatchSigner {
    scheme: SignatureScheme,
    algorithm: String,
    signing_key: SigningKey,
    public_key_der: Vec<u8>,
    config: SignerConfig,
    release_bucket: Duration,
}

/// Load or generate the export signing key (P-256, PKCS#8 DER, stored in
/// `data_dir/export_signing_key.p8`).
pub fn load_or_generate_signing_key(
    data_dir: &str,
) -> Result<SigningKey, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("export_signing_key.p8");

    if key_path.exists() {
        let der = std::fs::read(&key_path)?;
        let key = SigningKey::from_pkcs8_der(&der)?;
        tracing::info!("Export signing key loaded from {}", key_path.display());
        return Ok(key);
    }

    let key = loop {
        let candidate: [u8; 32] = rand::rng().random();
        // from_slice rejects the (astronomically rare) out-of-range scalar
        if let Ok(key) = SigningKey::from_slice(&candidate) {
            break key;
        }
    };
    std::fs::write(&key_path, key.to_pkcs8_der()?.as_bytes())?;
    tracing::info!("Export signing key generated at {}", key_path.display());
    Ok(key)
}

impl BatchSigner {
    pub fn new(
        config: SignerConfig,
        signing_key: SigningKey,
        release_bucket: Duration,
    ) -> Result<Self, ExportError> {
        let scheme = SignatureScheme::from_oid(&config.algorithm)?;
        let public_key_der = signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|_| ExportError::UnsupportedAlgorithm(config.algorithm.clone()))?
            .as_bytes()
            .to_vec();
        Ok(BatchSigner {
            scheme,
            algorithm: config.algorithm.trim().to_string(),
            signing_key,
            public_key_der,
            config,
            release_bucket,
        })
    }

    /// SPKI DER encoding of the verification key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Encode, sign and zip a batch in the v1 format.
    pub fn encode(&self, keys: Vec<ExposureKey>) -> Result<SignedBatch, ExportError> {
        let keys = self.shuffled_non_empty(keys)?;
        let export_bin = self.export_bin_v1(&keys)?;
        let signature_list = self.signature_list_v1(&export_bin)?;
        self.finish_batch(&export_bin, &signature_list.encode_to_vec())
    }

    /// Encode, sign and zip a batch in the v2 format.
    pub fn encode_v2(&self, keys: Vec<ExposureKey>) -> Result<SignedBatch, ExportError> {
        let keys = self.shuffled_non_empty(keys)?;
        let export_bin = self.export_bin_v2(&keys)?;
        let signature_list = self.signature_list_v2(&export_bin)?;
        self.finish_batch(&export_bin, &signature_list.encode_to_vec())
    }

    /// Multi-day export: one outer zip holding one inner batch zip per
    /// non-empty day group, each in the v2 format.
    pub fn encode_grouped(
        &self,
        buckets: Vec<Vec<ExposureKey>>,
    ) -> Result<Vec<u8>, ExportError> {
        let mut grouped: BTreeMap<String, Vec<ExposureKey>> = BTreeMap::new();
        for keys in buckets {
            let Some(first) = keys.first() else { continue };
            grouped
                .entry(first.key_date().date().to_string())
                .or_default()
                .extend(keys);
        }

        let mut outer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (day, keys) in grouped {
            let batch = self.encode_v2(keys)?;
            outer.start_file(format!("key_export_{day}"), options)?;
            outer.write_all(&batch.zip)?;
        }
        Ok(outer.finish()?.into_inner())
    }

    fn shuffled_non_empty(
        &self,
        mut keys: Vec<ExposureKey>,
    ) -> Result<Vec<ExposureKey>, ExportError> {
        if keys.is_empty() {
            return Err(ExportError::EmptyBatch);
        }
        // The wire order must not leak upload order.
        keys.shuffle(&mut rand::rng());
        Ok(keys)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ExportError> {
        match self.scheme {
            SignatureScheme::EcdsaP256Sha256 => {
                let signature: Signature = self.signing_key.try_sign(data)?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }

    fn finish_batch(
        &self,
        export_bin: &[u8],
        export_sig: &[u8],
    ) -> Result<SignedBatch, ExportError> {
        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.start_file("export.bin", options)?;
        zip.write_all(export_bin)?;
        zip.start_file("export.sig", options)?;
        zip.write_all(export_sig)?;
        let archive = zip.finish()?.into_inner();

        let mut digest = Sha256::new();
        digest.update(export_bin);
        digest.update(&self.public_key_der);

        Ok(SignedBatch {
            hash: digest.finalize().to_vec(),
            zip: archive,
        })
    }

    fn batch_window(&self, keys: &[ExposureKey]) -> (u64, u64) {
        let start = keys[0].rolling_start_number as i64 * INTERVAL_SECS;
        let end = start + self.release_bucket.num_seconds();
        (start as u64, end as u64)
    }

    fn export_bin_v1(&self, keys: &[ExposureKey]) -> Result<Vec<u8>, ExportError> {
        let (start, end) = self.batch_window(keys);
        let teks = keys
            .iter()
            .map(|key| {
                Ok(v1::TemporaryExposureKey {
                    key_data: Some(decode_key_data(&key.key_data)?),
                    transmission_risk_level: Some(key.transmission_risk_level),
                    rolling_start_interval_number: Some(key.rolling_start_number),
                    rolling_period: Some(key.rolling_period),
                })
            })
            .collect::<Result<Vec<_>, ExportError>>()?;
        let export = v1::TemporaryExposureKeyExport {
            start_timestamp: Some(start),
            end_timestamp: Some(end),
            region: Some(self.config.region.clone()),
            batch_num: Some(1),
            batch_size: Some(1),
            signature_infos: vec![self.signature_info_v1()],
            keys: teks,
        };
        Ok(prefix_magic(&export.encode_to_vec()))
    }

    fn export_bin_v2(&self, keys: &[ExposureKey]) -> Result<Vec<u8>, ExportError> {
        let (start, end) = self.batch_window(keys);
        let teks = keys
            .iter()
            .map(|key| {
                Ok(v2::TemporaryExposureKey {
                    key_data: Some(decode_key_data(&key.key_data)?),
                    transmission_risk_level: None,
                    rolling_start_interval_number: Some(key.rolling_start_number),
                    rolling_period: Some(key.rolling_period),
                    report_type: key.report_type,
                    days_since_onset_of_symptoms: key
                        .days_since_onset_of_symptoms
                        .map(|days| days as i32),
                })
            })
            .collect::<Result<Vec<_>, ExportError>>()?;
        let export = v2::TemporaryExposureKeyExport {
            start_timestamp: Some(start),
            end_timestamp: Some(end),
            region: Some(self.config.region.clone()),
            batch_num: Some(1),
            batch_size: Some(1),
            signature_infos: vec![self.signature_info_v2()],
            keys: teks,
        };
        Ok(prefix_magic(&export.encode_to_vec()))
    }

    fn signature_info_v1(&self) -> v1::SignatureInfo {
        v1::SignatureInfo {
            app_bundle_id: Some(self.config.app_bundle_id.clone()),
            android_package: Some(self.config.apk_package.clone()),
            verification_key_version: Some(self.config.key_version.clone()),
            verification_key_id: Some(self.config.key_verification_id.clone()),
            signature_algorithm: Some(self.algorithm.clone()),
        }
    }

    fn signature_info_v2(&self) -> v2::SignatureInfo {
        v2::SignatureInfo {
            verification_key_version: Some(self.config.key_version.clone()),
            verification_key_id: Some(self.config.key_verification_id.clone()),
            signature_algorithm: Some(self.algorithm.clone()),
        }
    }

    fn signature_list_v1(&self, export_bin: &[u8]) -> Result<v1::TekSignatureList, ExportError> {
        let signature = self.sign(export_bin)?;
        Ok(v1::TekSignatureList {
            signatures: vec![v1::TekSignature {
                signature_info: Some(self.signature_info_v1()),
                batch_num: Some(1),
                batch_size: Some(1),
                signature: Some(signature),
            }],
        })
    }

    fn signature_list_v2(&self, export_bin: &[u8]) -> Result<v2::TekSignatureList, ExportError> {
        let signature = self.sign(export_bin)?;
        Ok(v2::TekSignatureList {
            signatures: vec![v2::TekSignature {
                signature_info: Some(self.signature_info_v2()),
                batch_num: Some(1),
                batch_size: Some(1),
                signature: Some(signature),
            }],
        })
    }
}

fn decode_key_data(key_data: &str) -> Result<Vec<u8>, ExportError> {
    BASE64.decode(key_data).map_err(|_| ExportError::InvalidKeyData)
}

fn prefix_magic(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(EXPORT_MAGIC.len() + payload.len());
    out.extend_from_slice(&EXPORT_MAGIC);
    out.extend_from_slice(payload);
    out
}
