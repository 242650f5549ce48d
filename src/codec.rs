//! Frame Codec (spec.md C2, §4.2).
//!
//! Stateless, schema-driven decoder for the start-byte-framed wire format:
//!
//! ```text
//! [start_byte : 1][pdu_id : 1][valid_bitfield : 4][field_1 : w1]...[field_n : wn]
//! ```
//!
//! All multi-byte integers are little-endian. Decoding is synchronous and
//! CPU-bound (spec.md §5) — it never suspends and never reads the clock.

use crate::error::CodecError;
use crate::schema::Schema;
use std::collections::HashMap;

/// A decoded PDU instance (spec.md §3 `Frame`).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pdu_name: String,
    /// `Some` only if the descriptor declared an `epoch: f64` field and its
    /// validity bit was set. The ingestion pipeline stamps wall-clock time
    /// when this is `None` (spec.md §4.2, §4.4) — the codec never does.
    pub epoch: Option<f64>,
    /// Sensor values keyed by field name; fields whose validity bit was
    /// clear are absent (spec.md §3).
    pub fields: HashMap<String, f64>,
}

/// Decode exactly one PDU starting at `buffer[cursor]`.
///
/// Returns the decoded frame and the number of bytes consumed. Per
/// spec.md §4.2, validity bit `i` (0-indexed from the first field after
/// the bitfield) gates whether field `i+1` is emitted; fields with a clear
/// bit are still consumed from the buffer (to keep the cursor aligned) but
/// dropped.
pub fn decode_one(
    schema: &Schema,
    buffer: &[u8],
    cursor: usize,
) -> Result<(Frame, usize), CodecError> {
    if cursor >= buffer.len() || buffer[cursor] != schema.start_byte() {
        return Err(CodecError::Framing);
    }
    if cursor + 1 >= buffer.len() {
        return Err(CodecError::ShortFrame);
    }
    let pdu_id = buffer[cursor + 1];
    let descriptor = schema.lookup(pdu_id).ok_or(CodecError::UnknownPdu(pdu_id))?;

    let total_len = 2 + descriptor.body_length();
    if buffer.len() - cursor < total_len {
        return Err(CodecError::ShortFrame);
    }

    let bitfield_start = cursor + 2;
    let valid_bitfield = u32::from_le_bytes(
        buffer[bitfield_start..bitfield_start + 4]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    );

    let mut fields = HashMap::new();
    let mut epoch = None;
    let mut offset = bitfield_start + 4;
    for (i, field) in descriptor.fields.iter().enumerate() {
        let width = field.wire_type.width();
        let is_valid = (valid_bitfield >> i) & 1 == 1;
        if is_valid {
            let value = field.wire_type.decode(&buffer[offset..offset + width]);
            if descriptor.epoch_field_index == Some(i) {
                epoch = Some(value);
            } else {
                fields.insert(field.name.clone(), value);
            }
        }
        offset += width;
    }

    let frame = Frame {
        pdu_name: descriptor.name.clone(),
        epoch,
        fields,
    };
    Ok((frame, total_len))
}

/// Decode every complete PDU in `buffer`, invoking `handler` for each.
///
/// Stops and returns the error at the first framing failure; no
/// resynchronisation is attempted within a buffer (spec.md §4.2, §9 open
/// question 1). Callers are expected to discard the remainder of the
/// buffer on error and continue with the next delivery.
pub fn decode_stream(
    schema: &Schema,
    buffer: &[u8],
    mut handler: impl FnMut(Frame),
) -> Result<(), CodecError> {
    let mut cursor = 0;
    while cursor < buffer.len() {
        let (frame, consumed) = decode_one(schema, buffer, cursor)?;
        handler(frame);
        cursor += consumed;
    }
    Ok(())
}

/// Like [`decode_stream`], but reports where decoding stopped instead of
/// aborting the whole call on error. Used by the Ingestion Pipeline to
/// implement the carry-buffer enhancement from spec.md §9 item 5: a
/// `ShortFrame` at the tail of `buffer` means a PDU is split across two
/// transport deliveries, not a malformed stream, so the pipeline can
/// retain `buffer[cursor..]` and retry once more bytes arrive instead of
/// discarding it as a framing error.
pub fn decode_buffer(
    schema: &Schema,
    buffer: &[u8],
    mut handler: impl FnMut(Frame),
) -> (usize, Option<CodecError>) {
    let mut cursor = 0;
    while cursor < buffer.len() {
        match decode_one(schema, buffer, cursor) {
            Ok((frame, consumed)) => {
                handler(frame);
                cursor += consumed;
            }
            Err(err) => return (cursor, Some(err)),
        }
    }
    (cursor, None)
}
