//! RSA handshake key-wrap plus AES-256-CBC symmetric crypto for the gateway wire protocol.
//!
//! Keeps the shape of the original chacha20poly1305 module (free encrypt/decrypt/random_bytes
//! functions, fixed key size) but swaps the primitive per the documented RSA/AES choice.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Encrypts `plain` with AES-256-CBC under `key`, prepending a fresh random 16-byte IV to the
/// returned ciphertext (spec §9: "AES-256-CBC with a 16-byte random IV prepended to ciphertext").
pub fn aes_encrypt(key: &[u8; KEY_SIZE], plain: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    random_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new(key.into(), &iv.into());
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain);

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a buffer produced by [`aes_encrypt`]. Fails if the buffer is shorter than one IV
/// or the padding/ciphertext is malformed.
pub fn aes_decrypt(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < IV_SIZE {
        return None;
    }
    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    decryptor.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()
}

/// Seals `plain` (typically `aes-key ‖ timestamp`, see spec §4.4) under an RSA public key using
/// PKCS1v15 encryption, as the handshake secret envelope.
pub fn rsa_seal(public_key: &RsaPublicKey, plain: &[u8]) -> rsa::Result<Vec<u8>> {
    public_key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plain)
}

/// Opens a handshake secret sealed by [`rsa_seal`].
pub fn rsa_open(private_key: &RsaPrivateKey, sealed: &[u8]) -> rsa::Result<Vec<u8>> {
    private_key.decrypt(Pkcs1v15Encrypt, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    #[test]
    fn aes_round_trip() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);
        let plain = b"action envelope payload";

        let sealed = aes_encrypt(&key, plain);
        assert!(sealed.len() >= IV_SIZE + plain.len());

        let opened = aes_decrypt(&key, &sealed).expect("decrypt should succeed");
        assert_eq!(opened, plain);
    }

    #[test]
    fn aes_decrypt_rejects_wrong_key() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);
        let mut other_key = [0u8; KEY_SIZE];
        random_bytes(&mut other_key);

        let sealed = aes_encrypt(&key, b"hello gateway");
        assert!(aes_decrypt(&other_key, &sealed).is_none());
    }

    #[test]
    fn rsa_round_trip() {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, 1024).expect("key generation should succeed");
        let public_key = RsaPublicKey::from(&private_key);
        assert!(public_key.n().bits() > 0);

        let plain = b"0123456789012345678901234567890123456789012";
        let sealed = rsa_seal(&public_key, plain).expect("seal should succeed");
        let opened = rsa_open(&private_key, &sealed).expect("open should succeed");
        assert_eq!(opened, plain);
    }
}
