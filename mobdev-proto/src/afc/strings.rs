//! Dictionary Responses: runs of NUL-terminated strings.
//!
//! A run is a sequence of NUL-terminated UTF-8 strings ended by an empty
//! string. Directory listings read it as a flat list of names; file and
//! device info read it pairwise as keys and values.
//!
//! On the wire the device omits the closing empty string because the
//! packet length already bounds the run; [`decode_payload`] supplies it.

use crate::DecodeError;

/// Decodes a complete run, which must end with an empty string.
///
/// ```
/// use mobdev_proto::afc::decode_strings;
///
/// assert_eq!(decode_strings(b"a\0b\0\0").unwrap(), ["a", "b"]);
/// assert!(decode_strings(b"\0").unwrap().is_empty());
/// assert!(decode_strings(b"a\0b\0").is_err());
/// ```
pub fn decode_strings(run: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut strings = Vec::new();
    let mut rest = run;
    loop {
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::NotEnoughData("missing string terminator"))?;
        if nul == 0 {
            return Ok(strings);
        }
        strings.push(String::from_utf8(rest[..nul].to_vec())?);
        rest = &rest[nul + 1..];
    }
}

/// Decodes the data block of a reply packet.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut run = Vec::with_capacity(payload.len() + 1);
    run.extend_from_slice(payload);
    run.push(0);
    decode_strings(&run)
}

/// Groups a decoded run into key/value pairs.
pub fn decode_pairs(strings: Vec<String>) -> Result<Vec<(String, String)>, DecodeError> {
    if strings.len() % 2 != 0 {
        return Err(DecodeError::NotEnoughData("key without value"));
    }
    let mut pairs = Vec::with_capacity(strings.len() / 2);
    let mut iter = strings.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Encodes strings the way the device sends them in a data block.
pub fn encode_payload<I, S>(strings: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buf = Vec::new();
    for s in strings {
        buf.extend_from_slice(s.as_ref().as_bytes());
        buf.push(0);
    }
    buf
}
