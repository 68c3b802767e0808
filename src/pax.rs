//! PAX extended-header (`x`/`g`) record codec and GNU long-name (`L`/`K`)
//! handling.

use hashbrown::HashMap;

use crate::error::PaxError;

pub const PAX_PATH: &str = "path";
pub const PAX_LINKPATH: &str = "linkpath";
pub const PAX_SIZE: &str = "size";

/// GNU long-name marker path: `././@LongLink`.
pub const GNU_LONGLINK_PATH: &str = "././@LongLink";

/// The recognized PAX attributes for one entry, plus whatever else was
/// present in the block so callers can introspect it (see
/// `unparsed_extended_attributes` in SPEC_FULL.md §10.5).
#[derive(Debug, Clone, Default)]
pub struct PaxAttributes {
    pub path: Option<String>,
    pub linkpath: Option<String>,
    pub size: Option<i64>,
    pub unparsed: HashMap<String, String>,
}

impl PaxAttributes {
    /// Overlays `other` on top of `self` (local-over-global semantics: the
    /// caller passes globals as `self` and a fresh local map as `other`, or
    /// calls this with the local map as `self` after cloning the globals).
    pub fn merge_from(&mut self, records: &[(String, String)]) {
        for (key, value) in records {
            match key.as_str() {
                PAX_PATH => self.path = Some(value.clone()),
                PAX_LINKPATH => self.linkpath = Some(value.clone()),
                PAX_SIZE => {
                    if let Ok(v) = value.trim().parse::<i64>() {
                        self.size = Some(v);
                    }
                }
                _ => {
                    self.unparsed.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Parses the `"<len> <key>=<value>\n"` records out of a PAX data block.
pub fn parse_pax_records(mut data: &[u8]) -> Result<Vec<(String, String)>, PaxError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or(PaxError::MalformedLength)?;
        let len_str =
            std::str::from_utf8(&data[..space]).map_err(|_| PaxError::MalformedLength)?;
        let record_len: usize = len_str.parse().map_err(|_| PaxError::MalformedLength)?;
        if record_len == 0 || record_len > data.len() || space >= record_len {
            return Err(PaxError::MalformedLength);
        }
        let record = &data[..record_len];
        let rest_after_len = &record[space + 1..];
        if rest_after_len.last() != Some(&b'\n') {
            return Err(PaxError::MalformedLength);
        }
        let eq = rest_after_len
            .iter()
            .position(|&b| b == b'=')
            .ok_or(PaxError::MissingSeparator)?;
        let key = std::str::from_utf8(&rest_after_len[..eq])
            .map_err(|_| PaxError::InvalidKeyUtf8)?
            .to_string();
        // The record ends in exactly one trailing '\n'.
        let value_bytes = &rest_after_len[eq + 1..rest_after_len.len() - 1];
        let value = std::str::from_utf8(value_bytes)
            .map_err(|_| PaxError::InvalidValueUtf8)?
            .to_string();
        out.push((key, value));
        data = &data[record_len..];
    }
    Ok(out)
}

/// Encodes one PAX record, resolving the self-referential length field by
/// fixpoint iteration (the length includes its own decimal digits).
fn encode_record(key: &str, value: &str, out: &mut Vec<u8>) {
    let suffix_len = 1 + key.len() + 1 + value.len() + 1; // " key=value\n"
    let mut len = suffix_len + 1;
    loop {
        let digits = decimal_digits(len);
        let candidate = digits + suffix_len;
        if candidate == len {
            break;
        }
        len = candidate;
    }
    out.extend_from_slice(len.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

fn decimal_digits(mut n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let mut digits = 0;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}

/// Encodes a full `x`/`g` data block body. Records are emitted in
/// lexicographic key order.
#[must_use]
pub fn encode_pax_block(records: &[(&str, &str)]) -> Vec<u8> {
    let mut sorted: Vec<&(&str, &str)> = records.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let mut out = Vec::new();
    for (key, value) in sorted {
        encode_record(key, value, &mut out);
    }
    out
}

/// Parses a GNU long-name/long-link data region: a NUL-terminated string.
pub fn parse_gnu_long_name(data: &[u8]) -> Result<String, PaxError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(PaxError::UnterminatedLongName)?;
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|_| PaxError::InvalidKeyUtf8)
}

/// Encodes a GNU long-name/long-link data region, NUL-terminated.
#[must_use]
pub fn encode_gnu_long_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 1);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_parses_record() {
        let block = encode_pax_block(&[("path", "foo/bar")]);
        let parsed = parse_pax_records(&block).unwrap();
        assert_eq!(parsed, vec![("path".to_string(), "foo/bar".to_string())]);
    }

    #[test]
    fn length_prefix_is_self_consistent() {
        // The decimal length prefix must count its own digits, so decoding
        // the prefix and re-measuring the record must agree.
        let block = encode_pax_block(&[("path", "0123456789012345")]);
        let space = block.iter().position(|&b| b == b' ').unwrap();
        let len: usize = std::str::from_utf8(&block[..space]).unwrap().parse().unwrap();
        assert_eq!(len, block.len());
    }

    #[test]
    fn multiple_records_sorted_lexicographically() {
        let block = encode_pax_block(&[("size", "5"), ("path", "a")]);
        let parsed = parse_pax_records(&block).unwrap();
        assert_eq!(parsed[0].0, "path");
        assert_eq!(parsed[1].0, "size");
    }

    #[test]
    fn gnu_long_name_roundtrip() {
        let encoded = encode_gnu_long_name("some/long/name");
        assert_eq!(parse_gnu_long_name(&encoded).unwrap(), "some/long/name");
    }

    #[test]
    fn rejects_length_prefix_with_excess_leading_zeros_instead_of_panicking() {
        // The decoded length (1) is smaller than the byte offset of the
        // first space (21), which must be rejected rather than used to
        // slice past the end of a 1-byte record.
        let data = b"00000000000000000001 x=y\n";
        assert!(matches!(
            parse_pax_records(data),
            Err(PaxError::MalformedLength)
        ));
    }

    #[test]
    fn merge_applies_recognized_and_stashes_unknown() {
        let mut attrs = PaxAttributes::default();
        attrs.merge_from(&[
            (PAX_PATH.to_string(), "a/b".to_string()),
            (PAX_SIZE.to_string(), "42".to_string()),
            ("comment".to_string(), "hi".to_string()),
        ]);
        assert_eq!(attrs.path.as_deref(), Some("a/b"));
        assert_eq!(attrs.size, Some(42));
        assert_eq!(attrs.unparsed.get("comment").map(String::as_str), Some("hi"));
    }
}
