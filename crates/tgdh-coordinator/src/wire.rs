//! The canonical text encoding of a blind-key announcement:
//! `<l,v>:BLIND`, where `BLIND` is the decimal blind value.

use num_bigint::BigUint;
use tgdh_core::{NodePos, Result, TgdhError};

/// Render `(pos, value)` as `<l,v>:BLIND`.
pub fn encode_blind(pos: NodePos, value: &BigUint) -> String {
    format!("{}:{}", pos.name(), value)
}

/// Parse the canonical `<l,v>:BLIND` encoding back into its parts.
pub fn decode_blind(text: &str) -> Result<(NodePos, BigUint)> {
    let (name, blind) = text
        .split_once(':')
        .ok_or_else(|| TgdhError::serialization(format!("missing ':' in {text:?}")))?;
    let inner = name
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| TgdhError::serialization(format!("malformed position name {name:?}")))?;
    let (l_str, v_str) = inner
        .split_once(',')
        .ok_or_else(|| TgdhError::serialization(format!("malformed position name {name:?}")))?;
    let l: u32 = l_str
        .parse()
        .map_err(|err| TgdhError::serialization(format!("invalid level {l_str:?}: {err}")))?;
    let v: u64 = v_str
        .parse()
        .map_err(|err| TgdhError::serialization(format!("invalid index {v_str:?}: {err}")))?;
    let value: BigUint = blind
        .parse()
        .map_err(|err| TgdhError::serialization(format!("invalid blind value {blind:?}: {err}")))?;
    Ok((NodePos::new(l, v), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_the_canonical_grammar() {
        assert_eq!(encode_blind(NodePos::new(1, 0), &BigUint::from(10u32)), "<1,0>:10");
        assert_eq!(encode_blind(NodePos::ROOT, &BigUint::from(2u32)), "<0,0>:2");
    }

    #[test]
    fn decode_is_the_exact_inverse_of_encode() {
        let pos = NodePos::new(2, 3);
        let value = BigUint::from(987654321u64);
        let encoded = encode_blind(pos, &value);
        let (decoded_pos, decoded_value) = decode_blind(&encoded).unwrap();
        assert_eq!(decoded_pos, pos);
        assert_eq!(decoded_value, value);
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(decode_blind("garbage").is_err());
        assert!(decode_blind("<1,0>:not-a-number").is_err());
        assert!(decode_blind("1,0>:10").is_err());
    }
}
