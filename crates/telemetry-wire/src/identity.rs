use crate::{Identity, Result, WireError, IDENTITY_FRAME_LEN, IDENTITY_MAX};
use core::str::FromStr;

/// Decode and checksum-validate a 15-digit login frame.
///
/// Each byte carries a raw digit value (0-9), most significant first. The
/// returned identity keeps the trailing check digit. Does not allocate.
pub fn decode_identity(frame: &[u8; IDENTITY_FRAME_LEN]) -> Result<Identity> {
    let mut checksum: u32 = 0;
    let mut value: u64 = 0;

    for (i, &digit) in frame.iter().enumerate() {
        if digit > 9 {
            return Err(WireError::InvalidDigit {
                position: i,
                value: digit,
            });
        }
        checksum += luhn_term(i, digit);
        value = value * 10 + u64::from(digit);
    }

    if checksum % 10 != 0 {
        return Err(WireError::ChecksumMismatch);
    }
    Ok(Identity::from_raw(value))
}

/// Raw digit frame for an identity, the inverse of [`decode_identity`].
pub fn encode_identity(identity: Identity) -> [u8; IDENTITY_FRAME_LEN] {
    let mut frame = [0u8; IDENTITY_FRAME_LEN];
    let mut rest = identity.get();
    for slot in frame.iter_mut().rev() {
        *slot = (rest % 10) as u8;
        rest /= 10;
    }
    frame
}

/// Convert text such as `"490154203237518"` into a raw digit frame.
///
/// Only the shape is checked here; the checksum is left to [`decode_identity`].
pub fn identity_frame_from_str(text: &str) -> Result<[u8; IDENTITY_FRAME_LEN]> {
    let text = text.trim();
    if text.len() != IDENTITY_FRAME_LEN {
        return Err(WireError::InvalidText("expected exactly 15 digits"));
    }
    let mut frame = [0u8; IDENTITY_FRAME_LEN];
    for (slot, ch) in frame.iter_mut().zip(text.bytes()) {
        if !ch.is_ascii_digit() {
            return Err(WireError::InvalidText("non-digit character"));
        }
        *slot = ch - b'0';
    }
    Ok(frame)
}

/// Append the check digit to a 14-digit prefix.
pub fn with_check_digit(prefix: &[u8; IDENTITY_FRAME_LEN - 1]) -> Result<[u8; IDENTITY_FRAME_LEN]> {
    let mut frame = [0u8; IDENTITY_FRAME_LEN];
    let mut sum: u32 = 0;
    for (i, &digit) in prefix.iter().enumerate() {
        if digit > 9 {
            return Err(WireError::InvalidDigit {
                position: i,
                value: digit,
            });
        }
        sum += luhn_term(i, digit);
        frame[i] = digit;
    }
    // The last position is never doubled.
    frame[IDENTITY_FRAME_LEN - 1] = ((10 - sum % 10) % 10) as u8;
    Ok(frame)
}

fn luhn_term(position: usize, digit: u8) -> u32 {
    let d = u32::from(digit);
    if (position + 1) % 2 == 0 {
        let doubled = d * 2;
        if doubled > 9 {
            doubled - 9
        } else {
            doubled
        }
    } else {
        d
    }
}

impl TryFrom<&[u8]> for Identity {
    type Error = WireError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let frame: &[u8; IDENTITY_FRAME_LEN] =
            bytes.try_into().map_err(|_| WireError::FrameLength {
                expected: IDENTITY_FRAME_LEN,
                actual: bytes.len(),
            })?;
        decode_identity(frame)
    }
}

impl TryFrom<u64> for Identity {
    type Error = WireError;

    fn try_from(raw: u64) -> Result<Self> {
        if raw > IDENTITY_MAX {
            return Err(WireError::IdentityOutOfRange(raw));
        }
        decode_identity(&encode_identity(Identity::from_raw(raw)))
    }
}

impl FromStr for Identity {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        decode_identity(&identity_frame_from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: [u8; 15] = [4, 9, 0, 1, 5, 4, 2, 0, 3, 2, 3, 7, 5, 1, 8];

    #[test]
    fn test_decode_valid_identity() {
        let id = decode_identity(&VALID).unwrap();
        assert_eq!(id.get(), 490154203237518);
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut frame = VALID;
        frame[14] = 1;
        assert_eq!(decode_identity(&frame), Err(WireError::ChecksumMismatch));
    }

    #[test]
    fn test_decode_rejects_ascii_digits() {
        let mut frame = VALID;
        frame[2] = b'A';
        frame[3] = b'B';
        assert_eq!(
            decode_identity(&frame),
            Err(WireError::InvalidDigit {
                position: 2,
                value: b'A'
            })
        );
    }

    #[test]
    fn test_invalid_digit_wins_over_checksum() {
        // Checksum would also fail here; the digit error is reported first.
        let mut frame = VALID;
        frame[14] = 10;
        assert!(matches!(
            decode_identity(&frame),
            Err(WireError::InvalidDigit { position: 14, .. })
        ));
    }

    #[test]
    fn test_all_zero_identity_is_valid() {
        let id = decode_identity(&[0u8; 15]).unwrap();
        assert_eq!(id.get(), 0);
        assert_eq!(id.to_string(), "000000000000000");
    }

    #[test]
    fn test_slice_of_wrong_length_is_contract_error() {
        let err = Identity::try_from(&[1u8, 2][..]).unwrap_err();
        assert_eq!(
            err,
            WireError::FrameLength {
                expected: 15,
                actual: 2
            }
        );
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_encode_is_inverse_of_decode() {
        let id = decode_identity(&VALID).unwrap();
        assert_eq!(encode_identity(id), VALID);
    }

    #[test]
    fn test_parse_from_text() {
        let id: Identity = "490154203237518".parse().unwrap();
        assert_eq!(id.get(), 490154203237518);
        assert_eq!(identity_frame_from_str("490154203237518").unwrap(), VALID);
        assert!(matches!(
            "49015420323751".parse::<Identity>(),
            Err(WireError::InvalidText(_))
        ));
        assert!(matches!(
            "49015420323751x".parse::<Identity>(),
            Err(WireError::InvalidText(_))
        ));
        assert_eq!(
            "490154203237511".parse::<Identity>(),
            Err(WireError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_try_from_u64() {
        assert_eq!(Identity::try_from(490154203237518u64).unwrap().get(), 490154203237518);
        assert_eq!(
            Identity::try_from(1_000_000_000_000_000u64),
            Err(WireError::IdentityOutOfRange(1_000_000_000_000_000))
        );
        assert_eq!(
            Identity::try_from(490154203237511u64),
            Err(WireError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_with_check_digit() {
        let mut prefix = [0u8; 14];
        prefix.copy_from_slice(&VALID[..14]);
        assert_eq!(with_check_digit(&prefix).unwrap(), VALID);
    }
}
