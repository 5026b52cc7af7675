//! IEEE-488.2 block data encoding and decoding.
//!
//! Definite-length blocks look like `#nd...dBBBB...`: after `#`, one digit
//! gives the width of the length field, the length field gives the payload
//! byte count. `#0` starts an indefinite-length block running to the message
//! terminator. Trace data from analyzers arrives this way when the
//! instrument is put into a binary format (`FORMat REAL,64`).

use crate::error::{ScpiError, ScpiResult};

/// Byte order of binary payloads.
///
/// IEEE-488.2 `REAL,64` data is big-endian unless the instrument is told to
/// swap (`FORMat:BORDer SWAPped`); drivers in this crate request swapped
/// order so the host-friendly default here is little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first (`FORMat:BORDer SWAPped`).
    #[default]
    Little,
    /// Most significant byte first (`FORMat:BORDer NORMal`).
    Big,
}

/// Prefix `data` with a definite-length block header.
pub fn encode_block(data: &[u8]) -> Vec<u8> {
    let len = data.len().to_string();
    let mut out = Vec::with_capacity(2 + len.len() + data.len());
    out.push(b'#');
    // Payload length is bounded by what a digit count of 9 can describe.
    out.extend_from_slice(len.len().to_string().as_bytes());
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Parse a block header.
///
/// Returns `(header_len, payload_len)`; `payload_len` is `None` for an
/// indefinite-length (`#0`) block.
pub fn decode_block_header(raw: &[u8]) -> ScpiResult<(usize, Option<usize>)> {
    if raw.first() != Some(&b'#') {
        return Err(ScpiError::BadBlock("missing '#' header".into()));
    }
    let ndigits = raw
        .get(1)
        .and_then(|b| (*b as char).to_digit(10))
        .ok_or_else(|| ScpiError::BadBlock("header digit count is not a digit".into()))?
        as usize;
    if ndigits == 0 {
        return Ok((2, None));
    }
    let field = raw
        .get(2..2 + ndigits)
        .ok_or_else(|| ScpiError::BadBlock("truncated header length field".into()))?;
    let nbytes: usize = std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ScpiError::BadBlock("header length field is not a number".into()))?;
    Ok((2 + ndigits, Some(nbytes)))
}

/// Strip the header and return the payload.
///
/// The payload must be complete; missing bytes are an error. One or two
/// trailing bytes after the payload are tolerated only when they are `\r` or
/// `\n` terminators, anything else is an error. Indefinite-length blocks
/// take the rest of the buffer, minus trailing terminators.
pub fn decode_block(raw: &[u8]) -> ScpiResult<&[u8]> {
    let (header_len, payload_len) = decode_block_header(raw)?;
    let body = &raw[header_len..];
    let Some(nbytes) = payload_len else {
        let mut end = body.len();
        while end > 0 && matches!(body[end - 1], b'\r' | b'\n') {
            end -= 1;
        }
        return Ok(&body[..end]);
    };
    if body.len() < nbytes {
        return Err(ScpiError::BadBlock(format!(
            "payload truncated: header says {nbytes} bytes, got {}",
            body.len()
        )));
    }
    let extra = &body[nbytes..];
    if extra.len() > 2 || extra.iter().any(|b| !matches!(b, b'\r' | b'\n')) {
        return Err(ScpiError::BadBlock(format!(
            "{} unexpected bytes after payload",
            extra.len()
        )));
    }
    Ok(&body[..nbytes])
}

macro_rules! typed_decoder {
    ($name:ident, $ty:ty, $width:expr, $doc:literal) => {
        #[doc = $doc]
        pub fn $name(payload: &[u8], order: ByteOrder) -> ScpiResult<Vec<$ty>> {
            if payload.len() % $width != 0 {
                return Err(ScpiError::BadBlock(format!(
                    "payload of {} bytes is not a whole number of {}-byte values",
                    payload.len(),
                    $width
                )));
            }
            Ok(payload
                .chunks_exact($width)
                .map(|chunk| {
                    let mut bytes = [0u8; $width];
                    bytes.copy_from_slice(chunk);
                    match order {
                        ByteOrder::Little => <$ty>::from_le_bytes(bytes),
                        ByteOrder::Big => <$ty>::from_be_bytes(bytes),
                    }
                })
                .collect())
        }
    };
}

typed_decoder!(decode_f64, f64, 8, "Decode a payload of 64-bit floats.");
typed_decoder!(decode_f32, f32, 4, "Decode a payload of 32-bit floats.");
typed_decoder!(decode_u16, u16, 2, "Decode a payload of unsigned 16-bit integers.");
typed_decoder!(decode_i16, i16, 2, "Decode a payload of signed 16-bit integers.");

/// Parse ASCII comma-separated floats.
pub fn decode_ascii_f64(text: &str) -> ScpiResult<Vec<f64>> {
    text.trim()
        .split(',')
        .filter(|f| !f.trim().is_empty())
        .map(|f| {
            f.trim().parse().map_err(|_| ScpiError::ParseResponse {
                text: f.to_string(),
                wanted: "f64",
            })
        })
        .collect()
}

/// Decode a response that may be either binary block or ASCII data.
///
/// A leading `#` means block framing with 64-bit float payload; anything
/// else is treated as comma-separated ASCII.
pub fn decode_block_auto_f64(raw: &[u8], order: ByteOrder) -> ScpiResult<Vec<f64>> {
    if raw.first() == Some(&b'#') {
        return decode_f64(decode_block(raw)?, order);
    }
    decode_ascii_f64(&String::from_utf8_lossy(raw))
}

/// Arithmetic mean of a sample set.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n-1 normalization).
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// De-interleave `[x0, y0, x1, y1, ...]` into two columns.
pub fn two_columns(values: &[f64]) -> ScpiResult<(Vec<f64>, Vec<f64>)> {
    if values.len() % 2 != 0 {
        return Err(ScpiError::BadBlock(
            "odd value count cannot form two columns".into(),
        ));
    }
    let mut xs = Vec::with_capacity(values.len() / 2);
    let mut ys = Vec::with_capacity(values.len() / 2);
    for pair in values.chunks_exact(2) {
        xs.push(pair[0]);
        ys.push(pair[1]);
    }
    Ok((xs, ys))
}

/// De-interleave `[re0, im0, re1, im1, ...]` into (re, im) pairs, as VNAs
/// return S-parameter data.
pub fn complex_pairs(values: &[f64]) -> ScpiResult<Vec<(f64, f64)>> {
    if values.len() % 2 != 0 {
        return Err(ScpiError::BadBlock(
            "odd value count cannot form complex pairs".into(),
        ));
    }
    Ok(values.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_header() {
        let block = encode_block(&[1, 2, 3, 4, 5]);
        assert_eq!(&block[..3], b"#15");
        let (hdr, len) = decode_block_header(&block).unwrap();
        assert_eq!((hdr, len), (3, Some(5)));
        assert_eq!(decode_block(&block).unwrap(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn long_payload_grows_length_field() {
        let data = vec![0u8; 1234];
        let block = encode_block(&data);
        assert_eq!(&block[..6], b"#41234");
    }

    #[test]
    fn trailing_terminators_are_tolerated() {
        assert_eq!(decode_block(b"#14abcd\r\n").unwrap(), b"abcd");
        assert_eq!(decode_block(b"#14abcd\n").unwrap(), b"abcd");
        assert_eq!(decode_block(b"#14abcd").unwrap(), b"abcd");
    }

    #[test]
    fn bad_blocks_are_rejected() {
        // Missing payload bytes.
        assert!(decode_block(b"#18abcd").is_err());
        // Non-terminator extra bytes.
        assert!(decode_block(b"#14abcdXY").is_err());
        // Three extra bytes, even as terminators.
        assert!(decode_block(b"#14abcd\r\n\n").is_err());
        // No header.
        assert!(decode_block(b"abcd").is_err());
        // Header digit count not a digit.
        assert!(decode_block(b"#xabcd").is_err());
    }

    #[test]
    fn indefinite_block_takes_rest_of_message() {
        assert_eq!(decode_block(b"#0abcdef\r\n").unwrap(), b"abcdef");
    }

    #[test]
    fn f64_decode_both_orders() {
        let le = encode_block(&1.5f64.to_le_bytes());
        assert_eq!(
            decode_f64(decode_block(&le).unwrap(), ByteOrder::Little).unwrap(),
            vec![1.5]
        );
        let be = encode_block(&1.5f64.to_be_bytes());
        assert_eq!(
            decode_f64(decode_block(&be).unwrap(), ByteOrder::Big).unwrap(),
            vec![1.5]
        );
        assert!(decode_f64(b"1234567", ByteOrder::Little).is_err());
    }

    #[test]
    fn auto_decode_picks_format_by_first_byte() {
        let mut binary = b"#216".to_vec();
        for v in [1.0f64, 2.0] {
            binary.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode_block_auto_f64(&binary, ByteOrder::Little).unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            decode_block_auto_f64(b"1.0,2.0,3.0", ByteOrder::Little).unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn reducers() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(mean(&v), 2.5);
        let s = sample_std(&v);
        assert!((s - 1.2909944487358056).abs() < 1e-12);
        let (xs, ys) = two_columns(&v).unwrap();
        assert_eq!(xs, vec![1.0, 3.0]);
        assert_eq!(ys, vec![2.0, 4.0]);
        assert_eq!(complex_pairs(&v).unwrap(), vec![(1.0, 2.0), (3.0, 4.0)]);
        assert!(two_columns(&[1.0, 2.0, 3.0]).is_err());
    }
}
