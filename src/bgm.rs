//! Background-music pool: candidate tracks loaded once at startup, one
//! picked at random per chapter during post-processing.

use std::io;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

/// Immutable set of candidate background tracks.
#[derive(Debug, Clone, Default)]
pub struct BgmPool {
    tracks: Vec<PathBuf>,
}

impl BgmPool {
    /// Collect every `.mp3` file directly inside `dir`, sorted by name so
    /// the pool contents are deterministic for a given directory.
    pub fn load(dir: &Path) -> Result<Self, io::Error> {
        let mut tracks = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
            {
                tracks.push(path);
            }
        }
        tracks.sort();
        info!(dir = %dir.display(), tracks = tracks.len(), "loaded background music pool");
        Ok(Self { tracks })
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Pick one track uniformly at random, or `None` if the pool is empty.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Path> {
        self.tracks.choose(rng).map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    #[test]
    fn load_keeps_only_mp3_files_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["b.mp3", "a.MP3", "notes.txt", "c.wav"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let pool = BgmPool::load(dir.path()).unwrap();
        assert_eq!(
            pool.tracks,
            vec![dir.path().join("a.MP3"), dir.path().join("b.mp3")]
        );
    }

    #[test]
    fn empty_pool_yields_no_track() {
        let dir = TempDir::new().unwrap();
        let pool = BgmPool::load(dir.path()).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.choose(&mut StdRng::seed_from_u64(7)), None);
    }

    #[test]
    fn seeded_selection_is_deterministic() {
        let dir = TempDir::new().unwrap();
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pool = BgmPool::load(dir.path()).unwrap();

        let first = pool.choose(&mut StdRng::seed_from_u64(42)).unwrap().to_path_buf();
        let second = pool.choose(&mut StdRng::seed_from_u64(42)).unwrap().to_path_buf();
        assert_eq!(first, second);
    }
}
