use sha1::Digest;

/// A fixed-size unit of content validated by hash (§3). All pieces in a
/// torrent are the same length except the final one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
}

impl Piece {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> Self {
        Self { index, hash, length }
    }

    /// SHA-1(data) == hash, per §4.2's piece-completion check.
    pub fn verify(&self, data: &[u8]) -> bool {
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_matching_data() {
        let data = b"hello world";
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        let hash: [u8; 20] = hasher.finalize().into();
        let piece = Piece::new(0, hash, data.len() as u32);
        assert!(piece.verify(data));
        assert!(!piece.verify(b"wrong data"));
    }
}
