//! Secured upload envelope (spec §4.12): nonce + HMAC-SHA-256 + optional
//! AES-128-CBC + base64 framing, grounded on the teacher's use of
//! `critical-section`-guarded NVS commits for its own credential store and
//! on its `hmac-sha256`/`sha2`/`aes`/`cbc`/`base64` dependency choices,
//! carried over unchanged here since they're exactly the primitives this
//! envelope needs.

pub mod nonce;

use crate::error::SecurityError;
use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use nonce::NonceStore;
use serde::{Deserialize, Serialize};

pub const HMAC_KEY_LEN: usize = 32;
pub const ENC_KEY_LEN: usize = 16;
pub const MAX_PLAINTEXT_BYTES: usize = 4096;

/// Fixed IV used for AES-128-CBC (spec §4.12 step 3: "fixed IV"). Matches
/// the existing server-side contract this firmware interoperates with.
const FIXED_IV: [u8; 16] = [0u8; 16];

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuredPayload {
    pub nonce: u32,
    pub payload: String,
    pub mac: String,
    pub encrypted: bool,
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_eq_constant_time(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hmac(key: &[u8; HMAC_KEY_LEN], nonce: u32, payload_bytes: &[u8]) -> [u8; 32] {
    let mut msg = Vec::with_capacity(4 + payload_bytes.len());
    msg.extend_from_slice(&nonce::to_be_bytes(nonce));
    msg.extend_from_slice(payload_bytes);
    hmac_sha256::HMAC::mac(&msg, key)
}

fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - (data.len() % block_size);
    let mut out = data.to_vec();
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

fn pkcs7_unpad(data: &[u8]) -> Option<&[u8]> {
    let pad_len = *data.last()? as usize;
    if pad_len == 0 || pad_len > data.len() || pad_len > 16 {
        return None;
    }
    if data[data.len() - pad_len..].iter().any(|&b| b as usize != pad_len) {
        return None;
    }
    Some(&data[..data.len() - pad_len])
}

fn encrypt(enc_key: &[u8; ENC_KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let padded = pkcs7_pad(plaintext, 16);
    let mut buf = padded;
    let enc = Aes128CbcEnc::new(enc_key.into(), &FIXED_IV.into());
    let n = buf.len();
    let ct = enc
        .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, n)
        .expect("buffer length is already a multiple of the block size");
    ct.to_vec()
}

fn decrypt(enc_key: &[u8; ENC_KEY_LEN], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    let dec = Aes128CbcDec::new(enc_key.into(), &FIXED_IV.into());
    let pt = dec
        .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
        .ok()?;
    pkcs7_unpad(pt).map(<[u8]>::to_vec)
}

/// Build a secured envelope around `plaintext_json` (spec §4.12 steps 1-7).
pub fn secure_payload(
    plaintext_json: &str,
    nonce_store: &dyn NonceStore,
    hmac_key: &[u8; HMAC_KEY_LEN],
    enc_key: Option<&[u8; ENC_KEY_LEN]>,
) -> Result<SecuredPayload, SecurityError> {
    let payload_bytes = plaintext_json.as_bytes();
    if payload_bytes.len() > MAX_PLAINTEXT_BYTES {
        return Err(SecurityError::PlaintextTooLarge);
    }

    // Nonce is incremented before the MAC is computed and before the
    // payload ever leaves this function, matching the spec's
    // single-critical-section invariant: a crash here is a replay-window
    // gap, never a replay.
    let nonce = nonce_store.fetch_and_increment()?;

    let mac = to_hex(&hmac(hmac_key, nonce, payload_bytes));

    let (enc_bytes, encrypted) = match enc_key {
        Some(key) => (encrypt(key, payload_bytes), true),
        None => (payload_bytes.to_vec(), false),
    };

    use base64::Engine;
    let b64_payload = base64::engine::general_purpose::STANDARD.encode(enc_bytes);

    Ok(SecuredPayload { nonce, payload: b64_payload, mac, encrypted })
}

/// Verify and decode a received envelope (spec §4.12 "Server counterpart").
/// On acceptance, `last_seen_nonce` is advanced; on rejection, it is left
/// untouched (spec testable property: rejection never advances it).
pub fn verify_payload(
    received: &SecuredPayload,
    last_seen_nonce: &mut u32,
    hmac_key: &[u8; HMAC_KEY_LEN],
    enc_key: Option<&[u8; ENC_KEY_LEN]>,
) -> Result<Vec<u8>, SecurityError> {
    if received.payload.is_empty() || received.mac.is_empty() {
        return Err(SecurityError::MissingField);
    }
    if received.nonce <= *last_seen_nonce {
        return Err(SecurityError::ReplayedNonce);
    }

    use base64::Engine;
    let enc_bytes = base64::engine::general_purpose::STANDARD
        .decode(&received.payload)
        .map_err(|_| SecurityError::MissingField)?;

    let plaintext = if received.encrypted {
        let key = enc_key.ok_or(SecurityError::MissingField)?;
        decrypt(key, &enc_bytes).ok_or(SecurityError::MacMismatch)?
    } else {
        enc_bytes
    };

    let expected_mac = to_hex(&hmac(hmac_key, received.nonce, &plaintext));
    if !hex_eq_constant_time(&expected_mac, &received.mac) {
        return Err(SecurityError::MacMismatch);
    }

    *last_seen_nonce = received.nonce;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonce::InMemoryNonceStore;

    const HMAC_KEY: [u8; HMAC_KEY_LEN] = [0x42; HMAC_KEY_LEN];
    const ENC_KEY: [u8; ENC_KEY_LEN] = [0x24; ENC_KEY_LEN];

    #[test]
    fn round_trip_without_encryption() {
        let store = InMemoryNonceStore::new(10_000);
        let envelope = secure_payload(r#"{"x":1}"#, &store, &HMAC_KEY, None).unwrap();
        assert_eq!(envelope.nonce, 10_001);
        assert!(!envelope.encrypted);

        let mut last_seen = 10_000;
        let plaintext = verify_payload(&envelope, &mut last_seen, &HMAC_KEY, None).unwrap();
        assert_eq!(plaintext, br#"{"x":1}"#);
        assert_eq!(last_seen, 10_001);
    }

    #[test]
    fn round_trip_with_encryption() {
        let store = InMemoryNonceStore::new(1);
        let envelope =
            secure_payload(r#"{"y":2}"#, &store, &HMAC_KEY, Some(&ENC_KEY)).unwrap();
        assert!(envelope.encrypted);

        let mut last_seen = 0;
        let plaintext =
            verify_payload(&envelope, &mut last_seen, &HMAC_KEY, Some(&ENC_KEY)).unwrap();
        assert_eq!(plaintext, br#"{"y":2}"#);
    }

    #[test]
    fn replayed_nonce_is_rejected_without_advancing_last_seen() {
        let store = InMemoryNonceStore::new(10_000);
        let envelope = secure_payload(r#"{"x":1}"#, &store, &HMAC_KEY, None).unwrap();

        let mut last_seen = 10_001; // already seen this nonce
        let result = verify_payload(&envelope, &mut last_seen, &HMAC_KEY, None);
        assert_eq!(result, Err(SecurityError::ReplayedNonce));
        assert_eq!(last_seen, 10_001);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let store = InMemoryNonceStore::new(0);
        let mut envelope = secure_payload(r#"{"x":1}"#, &store, &HMAC_KEY, None).unwrap();
        envelope.mac.replace_range(0..1, if envelope.mac.starts_with('0') { "f" } else { "0" });

        let mut last_seen = 0;
        let result = verify_payload(&envelope, &mut last_seen, &HMAC_KEY, None);
        assert_eq!(result, Err(SecurityError::MacMismatch));
        assert_eq!(last_seen, 0);
    }

    #[test]
    fn missing_field_is_rejected() {
        let envelope =
            SecuredPayload { nonce: 1, payload: String::new(), mac: String::new(), encrypted: false };
        let mut last_seen = 0;
        let result = verify_payload(&envelope, &mut last_seen, &HMAC_KEY, None);
        assert_eq!(result, Err(SecurityError::MissingField));
    }
}
