use crate::{Field, InvalidFields, MeasurementRecord, MEASUREMENT_FRAME_LEN};

/// Decode a 40-byte measurement frame into `into`, field by field.
///
/// In-range fields are written; out-of-range fields (NaN included) leave the
/// existing value untouched. Returns true only if all five fields were valid.
pub fn decode_measurement(frame: &[u8; MEASUREMENT_FRAME_LEN], into: &mut MeasurementRecord) -> bool {
    decode_fields(frame, into).is_empty()
}

/// Same as [`decode_measurement`] but reports which fields were rejected.
pub fn decode_fields(
    frame: &[u8; MEASUREMENT_FRAME_LEN],
    into: &mut MeasurementRecord,
) -> InvalidFields {
    let mut invalid = InvalidFields::default();
    for field in Field::ALL {
        let value = read_f64_be(frame, field.offset());
        if field.contains(value) {
            into.set(field, value);
        } else {
            invalid.insert(field);
        }
    }
    invalid
}

/// Encode a record into its wire form. No range check is applied.
pub fn encode_measurement(record: &MeasurementRecord) -> [u8; MEASUREMENT_FRAME_LEN] {
    let mut frame = [0u8; MEASUREMENT_FRAME_LEN];
    for field in Field::ALL {
        let at = field.offset();
        frame[at..at + 8].copy_from_slice(&record.get(field).to_be_bytes());
    }
    frame
}

fn read_f64_be(frame: &[u8; MEASUREMENT_FRAME_LEN], at: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&frame[at..at + 8]);
    f64::from_be_bytes(raw)
}
