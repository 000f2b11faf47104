//! Canonical encodings for values shared across endorsers.
//!
//! Endorsers execute the same transaction independently, so every byte
//! that reaches the ledger must be identical on all of them:
//! - JSON objects are emitted with keys in sorted order
//! - Composite index keys join parts with a NUL separator
//! - Numbers inside composite keys are zero-padded to a fixed width so
//!   lexicographic order equals numeric order

use serde::Serialize;

use crate::error::{CoreError, Result};

/// Separator between parts of a composite key.
pub const COMPOSITE_SEP: char = '\u{0}';

/// Width used when padding numbers inside composite keys.
const NUMBER_WIDTH: usize = 20;

/// Serialize a value to canonical JSON (sorted object keys, no whitespace).
///
/// Goes through `serde_json::Value`, whose map type is ordered, so struct
/// field order never leaks into the output.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Join parts into a composite key.
///
/// Parts may not contain the separator.
pub fn composite_key<S: AsRef<str>>(parts: &[S]) -> Result<String> {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        if part.contains(COMPOSITE_SEP) {
            return Err(CoreError::InvalidIdentifier(part.escape_debug().to_string()));
        }
        if i > 0 {
            out.push(COMPOSITE_SEP);
        }
        out.push_str(part);
    }
    Ok(out)
}

/// Split a composite key into its parts.
pub fn split_composite(key: &str) -> Vec<String> {
    key.split(COMPOSITE_SEP).map(str::to_string).collect()
}

/// Zero-pad a non-negative number for use in a composite key.
pub fn pad_number(n: i64) -> Result<String> {
    if n < 0 {
        return Err(CoreError::InvalidIdentifier(format!(
            "negative number in composite key: {n}"
        )));
    }
    Ok(format!("{:0width$}", n, width = NUMBER_WIDTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Unordered {
        zeta: u32,
        alpha: &'static str,
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let json = canonical_json(&Unordered {
            zeta: 1,
            alpha: "a",
        })
        .unwrap();
        assert_eq!(json, r#"{"alpha":"a","zeta":1}"#);
    }

    #[test]
    fn test_composite_roundtrip() {
        let key = composite_key(&["p1", "d1", "00000000000000000100"]).unwrap();
        assert_eq!(split_composite(&key), vec!["p1", "d1", "00000000000000000100"]);
    }

    #[test]
    fn test_composite_rejects_separator() {
        assert!(composite_key(&["a\u{0}b"]).is_err());
    }

    #[test]
    fn test_pad_number_rejects_negative() {
        assert!(pad_number(-1).is_err());
        assert_eq!(pad_number(42).unwrap().len(), 20);
    }

    proptest! {
        #[test]
        fn padded_numbers_sort_numerically(a in 0i64..i64::MAX, b in 0i64..i64::MAX) {
            let pa = pad_number(a).unwrap();
            let pb = pad_number(b).unwrap();
            prop_assert_eq!(a.cmp(&b), pa.cmp(&pb));
        }
    }
}
