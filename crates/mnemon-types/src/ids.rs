use sha2::{Digest, Sha256};

/// Derive the 16-hex-char node ID for a segment. Each part is length-prefixed
/// (8-byte big-endian) before hashing so that inputs sharing delimiter
/// characters cannot collide.
pub fn deterministic_node_id(session_file: &str, start_id: &str, end_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [session_file, start_id, end_id] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random 16-hex-char job ID.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Hash a prompt's full text into the identity stored as `prompt_version`.
pub fn prompt_version_hash(prompt_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt_text.as_bytes());
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_16_hex() {
        let id = deterministic_node_id("s1.jsonl", "e1", "e10");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_node_id_deterministic() {
        let a = deterministic_node_id("s1.jsonl", "e1", "e10");
        let b = deterministic_node_id("s1.jsonl", "e1", "e10");
        assert_eq!(a, b);
    }

    #[test]
    fn test_node_id_distinct_inputs_differ() {
        let a = deterministic_node_id("s1.jsonl", "e1", "e10");
        let b = deterministic_node_id("s1.jsonl", "e1", "e11");
        assert_ne!(a, b);
    }

    #[test]
    fn test_length_prefix_prevents_shift_collisions() {
        // Without length prefixes these two would hash the same bytes.
        let a = deterministic_node_id("ab", "c", "d");
        let b = deterministic_node_id("a", "bc", "d");
        assert_ne!(a, b);
    }

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_job_id(), new_job_id());
    }
}
