use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::error::{CoreError, CoreResult};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;

/// IV used when the key tag carries none: the sequence number, big-endian.
pub fn derive_iv(sequence_number: u64) -> [u8; 16] {
    (sequence_number as u128).to_be_bytes()
}

/// Parse an `IV=` attribute. Shorter values are left-padded with zeros.
pub fn parse_iv(raw: &str) -> CoreResult<[u8; 16]> {
    let value = raw.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if value.is_empty() || value.len() > 32 {
        return Err(CoreError::Decryption(format!("invalid IV {raw:?}")));
    }
    let padded = format!("{value:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv)
        .map_err(|err| CoreError::Decryption(format!("invalid IV {raw:?}: {err}")))?;
    Ok(iv)
}

pub fn decrypt(
    ciphertext: &[u8],
    key: &[u8],
    sequence_number: u64,
    explicit_iv: Option<&[u8; 16]>,
) -> CoreResult<Vec<u8>> {
    if key.len() != 16 {
        return Err(CoreError::Decryption(format!(
            "AES-128 key must be 16 bytes, got {}",
            key.len()
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CoreError::Decryption(format!(
            "ciphertext length {} is not a multiple of the block size",
            ciphertext.len()
        )));
    }
    let iv = explicit_iv
        .copied()
        .unwrap_or_else(|| derive_iv(sequence_number));

    let mut buffer = ciphertext.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(key, &iv)
        .map_err(|err| CoreError::Decryption(format!("failed to initialize AES: {err}")))?;
    let plain_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| CoreError::Decryption("invalid PKCS#7 padding".to_string()))?
        .len();
    buffer.truncate(plain_len);
    Ok(buffer)
}

#[cfg(test)]
pub(crate) fn encrypt_for_tests(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    use cbc::cipher::BlockEncryptMut;

    let padded_len = (plaintext.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .expect("buffer sized for padding")
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    #[test]
    fn derives_iv_from_sequence_number() {
        let iv = derive_iv(7);
        assert_eq!(&iv[..15], &[0u8; 15]);
        assert_eq!(iv[15], 7);
        assert_eq!(derive_iv(0x0102)[14..], [0x01, 0x02]);
    }

    #[test]
    fn decrypts_with_sequence_iv_and_strips_padding() {
        let plaintext = b"\x47\x40\x00\x10 transport stream payload, 45 bytes!";
        let ciphertext = encrypt_for_tests(plaintext, &KEY, &derive_iv(7));
        assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
        assert!(ciphertext.len() > plaintext.len());

        let decrypted = decrypt(&ciphertext, &KEY, 7, None).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn explicit_iv_takes_precedence() {
        let iv = [9u8; 16];
        let ciphertext = encrypt_for_tests(b"block aligned 16", &KEY, &iv);
        assert_eq!(ciphertext.len(), 32);
        let decrypted = decrypt(&ciphertext, &KEY, 7, Some(&iv)).unwrap();
        assert_eq!(decrypted, b"block aligned 16");
    }

    #[test]
    fn rejects_truncated_or_corrupt_ciphertext() {
        let ciphertext = encrypt_for_tests(b"some segment bytes", &KEY, &derive_iv(1));
        let err = decrypt(&ciphertext[..ciphertext.len() - 3], &KEY, 1, None).unwrap_err();
        assert!(matches!(err, CoreError::Decryption(_)));

        match decrypt(&ciphertext, b"fedcba9876543210", 1, None) {
            Ok(plain) => assert_ne!(plain, b"some segment bytes"),
            Err(err) => assert!(matches!(err, CoreError::Decryption(_))),
        }

        assert!(decrypt(&[], &KEY, 1, None).is_err());
        assert!(decrypt(&ciphertext, &KEY[..8], 1, None).is_err());
    }

    #[test]
    fn parses_iv_attribute() {
        let iv = parse_iv("0x000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(iv, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        let short = parse_iv("0X2a").unwrap();
        assert_eq!(short[15], 0x2a);
        assert!(parse_iv("0xZZ").is_err());
        assert!(parse_iv("").is_err());
    }
}
