//! Reusable digest engines.
//!
//! Creating a digest engine for each encoded term is measurable in the bulk load hot loop, so a
//! store keeps a pool of engines for the configured algorithm. The pool is created when the store
//! is opened and shared by handle with everything that encodes terms.

use crate::storage::error::EncodingError;
use digest::DynDigest;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Mutex;

/// The message digest used to derive term identifiers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    fn new_engine(self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(format!("unknown digest algorithm {s}")),
        }
    }
}

/// A thread-safe pool of digest engines, created lazily on demand.
pub struct DigestPool {
    algorithm: DigestAlgorithm,
    max_idle: usize,
    idle: Mutex<Vec<Box<dyn DynDigest + Send>>>,
}

impl DigestPool {
    /// Creates an empty pool keeping at most `max_idle` engines between two uses.
    pub fn new(algorithm: DigestAlgorithm, max_idle: usize) -> Self {
        Self {
            algorithm,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Takes an engine from the pool. It goes back to the pool when the guard is dropped.
    pub fn acquire(&self) -> Result<PooledDigest<'_>, EncodingError> {
        let engine = self
            .idle
            .lock()
            .map_err(|_| EncodingError::PoolPoisoned)?
            .pop();
        Ok(PooledDigest {
            pool: self,
            engine: Some(engine.unwrap_or_else(|| self.algorithm.new_engine())),
        })
    }

    /// Number of engines currently waiting in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map_or(0, |idle| idle.len())
    }

    fn release(&self, mut engine: Box<dyn DynDigest + Send>) {
        // An engine is always handed out clean
        engine.reset();
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(engine);
            }
        }
    }

    /// Computes the 64 bits prefix of the digest of `data`.
    pub fn digest_u64(&self, data: &[u8]) -> Result<u64, EncodingError> {
        let mut engine = self.acquire()?;
        engine.update(data);
        let mut output = [0; 64];
        let size = engine.output_size();
        engine
            .finalize_into_reset(&mut output[..size])
            .map_err(EncodingError::Digest)?;
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&output[..8]);
        Ok(u64::from_be_bytes(prefix))
    }
}

/// A digest engine borrowed from a [`DigestPool`].
pub struct PooledDigest<'a> {
    pool: &'a DigestPool,
    engine: Option<Box<dyn DynDigest + Send>>,
}

impl Deref for PooledDigest<'_> {
    type Target = dyn DynDigest + Send;

    fn deref(&self) -> &Self::Target {
        // The engine is only taken out in drop
        self.engine.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledDigest<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledDigest<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_digest_is_stable() {
        let pool = DigestPool::new(DigestAlgorithm::Md5, 4);
        let first = pool.digest_u64(b"http://example.com/s").unwrap();
        assert_eq!(first, pool.digest_u64(b"http://example.com/s").unwrap());
        assert_ne!(first, pool.digest_u64(b"http://example.com/p").unwrap());
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(pool.digest_u64(b"").unwrap(), 0xd41d_8cd9_8f00_b204);
    }

    #[test]
    fn test_algorithms_differ() {
        let md5 = DigestPool::new(DigestAlgorithm::Md5, 1);
        let sha256 = DigestPool::new(DigestAlgorithm::Sha256, 1);
        assert_ne!(
            md5.digest_u64(b"foo").unwrap(),
            sha256.digest_u64(b"foo").unwrap()
        );
    }

    #[test]
    fn test_engines_are_reused_and_capped() {
        let pool = DigestPool::new(DigestAlgorithm::Sha1, 1);
        assert_eq!(pool.idle_count(), 0);
        {
            let _first = pool.acquire().unwrap();
            let _second = pool.acquire().unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        pool.digest_u64(b"foo").unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_engine_returns_after_a_panic() {
        let pool = Arc::new(DigestPool::new(DigestAlgorithm::Md5, 2));
        let cloned = Arc::clone(&pool);
        let result = thread::spawn(move || {
            let mut engine = cloned.acquire().unwrap();
            engine.update(b"half written");
            panic!("encoding aborted");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pool.idle_count(), 1);
        // The returned engine has been reset
        assert_eq!(pool.digest_u64(b"").unwrap(), 0xd41d_8cd9_8f00_b204);
    }

    #[test]
    fn test_concurrent_use() {
        let pool = Arc::new(DigestPool::new(DigestAlgorithm::Md5, 8));
        let expected = pool.digest_u64(b"shared").unwrap();
        let handles = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| pool.digest_u64(b"shared").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.join().unwrap().iter().all(|v| *v == expected));
        }
        assert!(pool.idle_count() <= 8);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA-256".parse(), Ok(DigestAlgorithm::Sha256));
        assert_eq!("md5".parse(), Ok(DigestAlgorithm::Md5));
        assert!("crc".parse::<DigestAlgorithm>().is_err());
    }
}
