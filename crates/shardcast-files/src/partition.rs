//! File partitioning.

use crate::FilesError;

/// Splits files into fixed-size parts and joins them back together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    part_size: usize,
}

impl Partitioner {
    /// Create a partitioner producing parts of `part_size` bytes
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ZeroPartSize`] if `part_size` is zero.
    pub fn new(part_size: usize) -> Result<Self, FilesError> {
        if part_size == 0 {
            return Err(FilesError::ZeroPartSize);
        }
        Ok(Self { part_size })
    }

    /// Get part size
    #[must_use]
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Calculate number of parts for a file
    #[must_use]
    pub fn part_count(&self, file_size: usize) -> usize {
        file_size.div_ceil(self.part_size)
    }

    /// Split `file` into parts of exactly `part_size` bytes.
    ///
    /// The final part is zero-padded.
    #[must_use]
    pub fn partition(&self, file: &[u8]) -> Vec<Vec<u8>> {
        file.chunks(self.part_size)
            .map(|chunk| {
                let mut part = vec![0u8; self.part_size];
                part[..chunk.len()].copy_from_slice(chunk);
                part
            })
            .collect()
    }

    /// Concatenate `parts` and strip the padding beyond `file_size`.
    #[must_use]
    pub fn join<P: AsRef<[u8]>>(&self, parts: &[P], file_size: usize) -> Vec<u8> {
        let mut file = Vec::with_capacity(parts.len() * self.part_size);
        for part in parts {
            file.extend_from_slice(part.as_ref());
        }
        file.truncate(file_size);
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_part_size_rejected() {
        assert_eq!(Partitioner::new(0), Err(FilesError::ZeroPartSize));
    }

    #[test]
    fn test_part_count() {
        let partitioner = Partitioner::new(100).unwrap();
        assert_eq!(partitioner.part_count(0), 0);
        assert_eq!(partitioner.part_count(1), 1);
        assert_eq!(partitioner.part_count(100), 1);
        assert_eq!(partitioner.part_count(101), 2);
        assert_eq!(partitioner.part_count(1000), 10);
    }

    #[test]
    fn test_partition_pads_last_part() {
        let partitioner = Partitioner::new(4).unwrap();
        let parts = partitioner.partition(b"abcdefghij");

        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() == 4));
        assert_eq!(parts[0], b"abcd");
        assert_eq!(parts[2], [b'i', b'j', 0, 0]);
    }

    #[test]
    fn test_join_strips_padding() {
        let partitioner = Partitioner::new(4).unwrap();
        let file = b"abcdefghij".to_vec();
        let parts = partitioner.partition(&file);

        assert_eq!(partitioner.join(&parts, file.len()), file);
    }

    #[test]
    fn test_exact_multiple() {
        let partitioner = Partitioner::new(5).unwrap();
        let file: Vec<u8> = (0..20).collect();
        let parts = partitioner.partition(&file);

        assert_eq!(parts.len(), 4);
        assert_eq!(partitioner.join(&parts, file.len()), file);
    }

    #[test]
    fn test_empty_file() {
        let partitioner = Partitioner::new(8).unwrap();
        let parts = partitioner.partition(&[]);
        assert!(parts.is_empty());
        assert!(partitioner.join(&parts, 0).is_empty());
    }

    #[test]
    fn test_thousand_bytes_ten_parts() {
        let partitioner = Partitioner::new(100).unwrap();
        let file = vec![7u8; 1000];
        let parts = partitioner.partition(&file);
        assert_eq!(parts.len(), 10);
        assert_eq!(partitioner.join(&parts, 1000), file);
    }
}
