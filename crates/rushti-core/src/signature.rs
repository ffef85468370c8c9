use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::ids::Signature;

/// Computes the 16-hex task signature over `instance|process|sorted(parameters)`.
///
/// Parameters are sorted by key (ties broken by value) so two tasks with the
/// same bag of parameters in different insertion order hash identically —
/// required for C4's per-signature duration history to actually accumulate
/// samples across runs.
pub fn compute_signature(
    instance: &str,
    process: &str,
    parameters: &BTreeMap<String, String>,
) -> Signature {
    let mut encoded = String::with_capacity(64);
    encoded.push_str(instance);
    encoded.push('|');
    encoded.push_str(process);
    encoded.push('|');
    for (i, (k, v)) in parameters.iter().enumerate() {
        if i > 0 {
            encoded.push(',');
        }
        let _ = write!(encoded, "{k}={v}");
    }

    let digest = blake3::hash(encoded.as_bytes());
    let hex = digest.to_hex();
    Signature::from_hex(hex[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn same_parameters_different_order_hash_identically() {
        let a = params(&[("b", "2"), ("a", "1")]);
        let b = params(&[("a", "1"), ("b", "2")]);
        assert_eq!(
            compute_signature("srv01", "proc", &a),
            compute_signature("srv01", "proc", &b)
        );
    }

    #[test]
    fn different_instance_hashes_differently() {
        let p = params(&[("a", "1")]);
        assert_ne!(
            compute_signature("srv01", "proc", &p),
            compute_signature("srv02", "proc", &p)
        );
    }

    #[test]
    fn signature_is_16_hex_chars() {
        let p = params(&[]);
        let sig = compute_signature("srv01", "proc", &p);
        assert_eq!(sig.as_str().len(), 16);
        assert!(sig.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
