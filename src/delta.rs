//! Thin wrapper around the rsync rolling-checksum library.
//!
//! Three operations are exposed: signature generation over a byte buffer,
//! delta generation against a previously stored signature, and patch
//! application against a basis. Signatures are opaque blobs compared only
//! by byte equality.

use anyhow::Context;
use fast_rsync::{apply, diff, Signature as RsyncSignature, SignatureOptions};

use crate::model::FileAttributes;

const BLOCK_SIZE: u32 = 16 * 1024;
const CRYPTO_HASH_SIZE: u32 = 8;

/// Serialized rsync signature blob. Empty means "no signature recorded".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Computes the rsync signature of `data`.
pub fn signature_of(data: &[u8]) -> Signature {
    let options = SignatureOptions {
        block_size: BLOCK_SIZE,
        crypto_hash_size: CRYPTO_HASH_SIZE,
    };
    Signature(RsyncSignature::calculate(data, options).serialized().to_vec())
}

/// Computes the signature recorded in the cache for one entry.
///
/// Attribute-only entries are signed over the raw 36-byte attribute record.
/// Data-bearing entries concatenate the attribute signature with the data
/// signature and sign the result again, so either an attribute or a content
/// change flips the final signature.
pub fn entry_signature(attrs: &FileAttributes, data: Option<&[u8]>) -> Signature {
    let attr_sig = signature_of(&attrs.serialize());
    match data {
        None => attr_sig,
        Some(data) => {
            let data_sig = signature_of(data);
            let mut combined = attr_sig.0;
            combined.extend_from_slice(&data_sig.0);
            signature_of(&combined)
        }
    }
}

/// Generates a delta of `new_data` against a stored basis signature,
/// appending the result to `out`.
pub fn delta(basis_sig: &Signature, new_data: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
    let parsed = RsyncSignature::deserialize(basis_sig.0.clone())
        .context("cached signature is not a valid rsync signature")?;
    let indexed = parsed.index();
    diff(&indexed, new_data, out).context("delta generation failed")?;
    Ok(())
}

/// Applies `delta_data` to `basis`, returning the reconstructed bytes.
pub fn patch(basis: &[u8], delta_data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    apply(basis, delta_data, &mut out).context("patch application failed")?;
    Ok(out)
}
