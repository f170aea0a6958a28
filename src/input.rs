//! Bytecode loaders (external collaborator, spec.md §6): turns a raw hex
//! file or a JSON build artifact into the bytes the lifter decodes, and
//! strips a trailing Solidity swarm-hash metadata blob, exactly as
//! `original_source/source/utils.py`'s `decode_bytecode` / `parse_json` /
//! `remove_swarm_hash` do.

use serde::Deserialize;

use crate::error::InputError;

/// Strips a trailing metadata/swarm-hash blob from `bytecode`, per
/// `utils.py: remove_swarm_hash`. The new-style marker is the ASCII
/// substring `bzzr0` somewhere near the end (CBOR-encoded metadata key);
/// the old style ends in `JUMP STOP` followed by 32 bytes of hash. If
/// neither pattern is found, the bytecode is returned unchanged.
pub fn remove_swarm_hash(bytecode: &[u8]) -> &[u8] {
    if let Some(index) = find_subslice(bytecode, b"bzzr0") {
        return &bytecode[..index.saturating_sub(2)];
    }

    if bytecode.len() >= 34 && bytecode[bytecode.len() - 34] == 0x56 && bytecode[bytecode.len() - 33] == 0x00 {
        return &bytecode[..bytecode.len() - 32];
    }

    bytecode
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decodes a hex string into bytes, tolerating an optional `0x` prefix and
/// surrounding whitespace (`utils.py: decode_bytecode`).
pub fn decode_hex(s: &str) -> Result<Vec<u8>, InputError> {
    let cleaned: String = s.trim().replace("0x", "").split_whitespace().collect();
    if cleaned.len() % 2 != 0 {
        return Err(InputError::OddLength);
    }
    let mut out = Vec::with_capacity(cleaned.len() / 2);
    let bytes = cleaned.as_bytes();
    for chunk in bytes.chunks(2) {
        let byte_str = std::str::from_utf8(chunk).map_err(|_| InputError::MalformedHex)?;
        let byte = u8::from_str_radix(byte_str, 16).map_err(|_| InputError::MalformedHex)?;
        out.push(byte);
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct JsonArtifact {
    bytecode: Option<String>,
    #[serde(rename = "deployedBytecode")]
    deployed_bytecode: Option<String>,
}

/// A decoded build artifact: deployment (constructor) bytecode and, if
/// present, the deployed runtime bytecode.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytecode: Vec<u8>,
    pub deployed_bytecode: Option<Vec<u8>>,
}

/// Parses a JSON build artifact's `bytecode` and `deployedBytecode` string
/// fields (`utils.py: parse_json`).
pub fn parse_json(text: &str) -> Result<Artifact, InputError> {
    let obj: JsonArtifact = serde_json::from_str(text)?;
    let bytecode = obj.bytecode.ok_or(InputError::MissingBytecodeField)?;
    let deployed_bytecode = obj.deployed_bytecode.map(|s| decode_hex(&s)).transpose()?;
    Ok(Artifact { bytecode: decode_hex(&bytecode)?, deployed_bytecode })
}

/// Loads an input file as either raw hex or a JSON artifact, based on
/// whether its trimmed contents start with `{`.
pub fn load(text: &str) -> Result<Artifact, InputError> {
    if text.trim_start().starts_with('{') {
        parse_json(text)
    } else {
        Ok(Artifact { bytecode: decode_hex(text)?, deployed_bytecode: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_tolerates_prefix_and_whitespace() {
        assert_eq!(decode_hex(" 0x60 60 ").unwrap(), vec![0x60, 0x60]);
    }

    #[test]
    fn decode_hex_rejects_odd_length() {
        assert!(matches!(decode_hex("0x600").unwrap_err(), InputError::OddLength));
    }

    #[test]
    fn decode_hex_rejects_non_hex_digits() {
        assert!(matches!(decode_hex("0xzz").unwrap_err(), InputError::MalformedHex));
    }

    #[test]
    fn new_style_swarm_hash_is_stripped() {
        let mut bytecode = vec![0x60, 0x60];
        bytecode.extend_from_slice(&[0xa1, 0x65]);
        bytecode.extend_from_slice(b"bzzr0");
        bytecode.extend_from_slice(&[0u8; 34]);
        let stripped = remove_swarm_hash(&bytecode);
        assert_eq!(stripped, &[0x60, 0x60]);
    }

    #[test]
    fn old_style_swarm_hash_is_stripped() {
        let mut bytecode = vec![0x60, 0x60, 0x56, 0x00];
        bytecode.extend_from_slice(&[0xab; 32]);
        let stripped = remove_swarm_hash(&bytecode);
        assert_eq!(stripped, &[0x60, 0x60, 0x56, 0x00]);
    }

    #[test]
    fn no_swarm_hash_leaves_bytecode_unchanged() {
        let bytecode = vec![0x60, 0x60, 0x01];
        assert_eq!(remove_swarm_hash(&bytecode), &bytecode[..]);
    }

    #[test]
    fn parse_json_reads_both_fields() {
        let text = r#"{"bytecode": "0x6001", "deployedBytecode": "0x6002"}"#;
        let artifact = parse_json(text).unwrap();
        assert_eq!(artifact.bytecode, vec![0x60, 0x01]);
        assert_eq!(artifact.deployed_bytecode, Some(vec![0x60, 0x02]));
    }
}
