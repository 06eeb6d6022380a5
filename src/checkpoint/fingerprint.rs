use sha2::{Digest, Sha256};

/// Bytes hashed from each of the head, middle, and tail of the file.
const SAMPLE_SPAN_BYTES: usize = 64 * 1024;

/// Cheap file identity: size, name, and a hash over three bounded
/// sampled ranges. The whole file is deliberately never hashed, so
/// two files that agree on name, size, and all three sampled ranges
/// collide. Accepted trade-off for recognizing "the same file" fast.
pub fn fingerprint(name: &str, size: u64, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(name.as_bytes());

    let len = bytes.len();
    if len > 0 {
        let span = SAMPLE_SPAN_BYTES.min(len);
        hasher.update(&bytes[..span]);
        let middle_start = (len / 2).saturating_sub(span / 2);
        hasher.update(&bytes[middle_start..(middle_start + span).min(len)]);
        hasher.update(&bytes[len - span..]);
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let bytes = vec![42u8; 1000];
        assert_eq!(
            fingerprint("a.wav", 1000, &bytes),
            fingerprint("a.wav", 1000, &bytes)
        );
    }

    #[test]
    fn test_name_and_size_change_identity() {
        let bytes = vec![0u8; 100];
        let base = fingerprint("a.wav", 100, &bytes);
        assert_ne!(base, fingerprint("b.wav", 100, &bytes));
        assert_ne!(base, fingerprint("a.wav", 101, &bytes));
    }

    #[test]
    fn test_sampled_ranges_change_identity() {
        // Large enough that head, middle, and tail spans are disjoint.
        let len = 1024 * 1024;
        let base_bytes = vec![0u8; len];

        let mut head = base_bytes.clone();
        head[10] = 1;
        let mut middle = base_bytes.clone();
        middle[len / 2] = 1;
        let mut tail = base_bytes.clone();
        tail[len - 10] = 1;

        let base = fingerprint("f.wav", len as u64, &base_bytes);
        assert_ne!(base, fingerprint("f.wav", len as u64, &head));
        assert_ne!(base, fingerprint("f.wav", len as u64, &middle));
        assert_ne!(base, fingerprint("f.wav", len as u64, &tail));
    }

    #[test]
    fn test_unsampled_middle_does_not_change_identity() {
        // A byte between the head and middle spans is never read.
        let len = 1024 * 1024;
        let base_bytes = vec![0u8; len];
        let mut tweaked = base_bytes.clone();
        tweaked[100 * 1024] = 1;

        assert_eq!(
            fingerprint("f.wav", len as u64, &base_bytes),
            fingerprint("f.wav", len as u64, &tweaked)
        );
    }

    #[test]
    fn test_small_and_empty_files() {
        assert_ne!(
            fingerprint("tiny.wav", 3, &[1, 2, 3]),
            fingerprint("tiny.wav", 3, &[1, 2, 4])
        );
        let empty = fingerprint("empty.wav", 0, &[]);
        assert_eq!(empty.len(), 64);
    }
}
