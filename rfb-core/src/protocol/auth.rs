//! VNC authentication (security type 2).
//!
//! The server sends a 16-byte challenge; the client returns it DES-ECB
//! encrypted with the password as key. The key is the first 8 password
//! bytes, zero padded, with the bits of every byte reversed.

use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};

/// Length of the challenge and of the response.
pub const CHALLENGE_LEN: usize = 16;

/// Build the DES key from a password.
pub fn des_key(password: &[u8]) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (k, &b) in key.iter_mut().zip(password) {
        *k = b.reverse_bits();
    }
    key
}

/// Encrypt `challenge` for `password`.
pub fn challenge_response(
    challenge: &[u8; CHALLENGE_LEN],
    password: &[u8],
) -> [u8; CHALLENGE_LEN] {
    let key = des_key(password);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bits_reversed_and_padded() {
        assert_eq!(des_key(b""), [0; 8]);
        let key = des_key(b"ab");
        assert_eq!(key[0], b'a'.reverse_bits());
        assert_eq!(key[1], b'b'.reverse_bits());
        assert_eq!(&key[2..], &[0; 6]);
        assert_eq!(des_key(b"0123456789"), des_key(b"01234567"));
    }

    #[test]
    fn zero_key_zero_block() {
        let response = challenge_response(&[0; 16], b"");
        let expected = [0x8C, 0xA6, 0x4D, 0xE9, 0xC1, 0xB1, 0x23, 0xA7];
        assert_eq!(&response[..8], &expected);
        assert_eq!(&response[8..], &expected);
    }

    #[test]
    fn standard_des_vector() {
        // Bit-reversed form of the key 01 23 45 67 89 AB CD EF.
        let password = [0x80, 0xC4, 0xA2, 0xE6, 0x91, 0xD5, 0xB3, 0xF7];
        let mut challenge = [0u8; 16];
        challenge[..8].copy_from_slice(b"Now is t");
        challenge[8..].copy_from_slice(b"Now is t");
        let response = challenge_response(&challenge, &password);
        let expected = [0x3F, 0xA4, 0x0E, 0x8A, 0x98, 0x4D, 0x48, 0x15];
        assert_eq!(&response[..8], &expected);
        assert_eq!(&response[8..], &expected);
    }
}
