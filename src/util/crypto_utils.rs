use bitcoin::hashes::hash160::Hash as BitcoinHash160;
use bitcoin::hashes::sha256::Hash as BitcoinSha256;
use bitcoin::hashes::sha256d::Hash as BitcoinSha256d;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1;
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;

use crate::util::status::{decode_error, internal_invariant, Status};

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = HmacEngine::<BitcoinSha256>::new(key);
    for part in parts {
        engine.input(part);
    }
    Hmac::from_engine(engine).to_byte_array()
}

/// HKDF-SHA256 with a single output block, used to derive the channel's
/// elkrem root from its secret.
///
/// Extract-then-expand per RFC 5869, truncated to the first expand block
/// since every derived key here is exactly 32 bytes.
pub fn hkdf_sha256(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32] {
    let pseudorandom_key = hmac_sha256(salt, &[secret]);
    hmac_sha256(&pseudorandom_key, &[info, &[1u8]])
}

/// Double SHA-256
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    BitcoinSha256d::hash(data).to_byte_array()
}

/// RIPEMD-160 of SHA-256
pub fn hash160(data: &[u8]) -> [u8; 20] {
    BitcoinHash160::hash(data).to_byte_array()
}

/// Add `tweak * G` to a public key.
///
/// The tweak is a 32-byte value interpreted as a scalar mod the curve order.
/// The astronomical cases - tweak at or above the order, or a result at
/// infinity - violate the revocation algebra and surface as
/// `InternalInvariant`.
pub fn add_pubkey_tweak<T: secp256k1::Verification>(
    secp_ctx: &Secp256k1<T>,
    base: &PublicKey,
    tweak: &[u8; 32],
) -> Result<PublicKey, Status> {
    let scalar = Scalar::from_be_bytes(*tweak)
        .map_err(|_| internal_invariant("key tweak out of range"))?;
    base.add_exp_tweak(secp_ctx, &scalar)
        .map_err(|err| internal_invariant(format!("pubkey tweak add failed: {}", err)))
}

/// Add a tweak to a secret key.
///
/// The homomorphic counterpart of [`add_pubkey_tweak`]: the result is the
/// private key of the tweaked public key.
pub fn add_privkey_tweak(base: SecretKey, tweak: &[u8; 32]) -> Result<SecretKey, Status> {
    let scalar = Scalar::from_be_bytes(*tweak)
        .map_err(|_| internal_invariant("key tweak out of range"))?;
    base.add_tweak(&scalar)
        .map_err(|err| internal_invariant(format!("privkey tweak add failed: {}", err)))
}

/// Convert a [Signature] to Bitcoin signature bytes, with SIGHASH_ALL
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// Parse a DER signature transmitted with the trailing sighash byte stripped
pub fn signature_from_wire(sigvec: &[u8]) -> Result<Signature, Status> {
    Signature::from_der(sigvec).map_err(|err| decode_error(format!("bad DER signature: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Message;

    // The elkrem root must be a stable function of the channel secret, and
    // distinct channels (or purposes) must land on distinct roots.
    #[test]
    fn elkrem_root_derivation_test() {
        let secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let root = hkdf_sha256(&secret.secret_bytes(), "elkrem root".as_bytes(), &[]);
        let again = hkdf_sha256(&secret.secret_bytes(), "elkrem root".as_bytes(), &[]);
        assert_eq!(root, again);

        let other_secret = SecretKey::from_slice(&[10u8; 32]).unwrap();
        assert_ne!(root, hkdf_sha256(&other_secret.secret_bytes(), "elkrem root".as_bytes(), &[]));
        assert_ne!(root, hkdf_sha256(&secret.secret_bytes(), "something else".as_bytes(), &[]));

        // and the root actually drives a usable sender
        let sender = crate::elkrem::ElkremSender::new(root);
        assert_eq!(sender.at_index(0).unwrap(), sender.at_index(0).unwrap());
        assert_ne!(sender.at_index(0).unwrap(), sender.at_index(1).unwrap());
    }

    // The tweak applied to a public key and to the matching secret key must
    // produce a consistent keypair.  The revocation scheme rests on this.
    #[test]
    fn tweak_homomorphism_test() {
        let secp_ctx = Secp256k1::new();
        let base = SecretKey::from_slice(&[11u8; 32]).unwrap();
        let base_pub = PublicKey::from_secret_key(&secp_ctx, &base);
        for i in 1u8..=5 {
            let tweak = double_sha256(&[i]);
            let tweaked_priv = add_privkey_tweak(base, &tweak).unwrap();
            let tweaked_pub = add_pubkey_tweak(&secp_ctx, &base_pub, &tweak).unwrap();
            assert_eq!(PublicKey::from_secret_key(&secp_ctx, &tweaked_priv), tweaked_pub);

            // and the derived pair actually signs
            let msg = Message::from_slice(&double_sha256(b"grab")).unwrap();
            let sig = secp_ctx.sign_ecdsa(&msg, &tweaked_priv);
            secp_ctx.verify_ecdsa(&msg, &sig, &tweaked_pub).unwrap();
        }
    }

    #[test]
    fn signature_from_wire_rejects_garbage_test() {
        assert_eq!(signature_from_wire(&[0x30, 0x01]).unwrap_err().code(), crate::util::status::Code::Decode);
    }
}
