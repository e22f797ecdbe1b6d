//! Transaction-replay guard: a set of (account, random id) fingerprints
//! for every transaction in a rolling window of committed blocks.
//!
//! The cache tracks the window `[max(0, H - W), H]` where H is the chain
//! height. An incremental `update` deletes only the keys that slid off the
//! left edge and inserts the keys of newly committed blocks, preserving
//! the invariant that the cache equals the union of the window's keys.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::chain::{ChainReader, LedgerError, TxFingerprint, TxKeyCodec};

/// Default window width in blocks.
pub const DEFAULT_WINDOW: u64 = 1000;

#[derive(Debug, Default)]
struct Inner {
    cache: HashSet<String>,
    start_blk: u64,
    end_blk: u64,
}

/// The rolling nonce cache. All operations are internally locked; `ok`
/// takes the write lock only when it may insert.
pub struct NonceCache {
    inner: RwLock<Inner>,
    window: u64,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            window,
        }
    }

    /// Reset the window bookkeeping and rebuild the cache from the chain.
    pub fn init(
        &self,
        chain: &dyn ChainReader,
        codec: &dyn TxKeyCodec,
    ) -> Result<(), LedgerError> {
        {
            let mut inner = self.inner.write();
            inner.start_blk = 0;
            inner.end_blk = 0;
        }
        self.update(chain, codec, true)
    }

    /// Admission check. Returns false iff the transaction's key is already
    /// cached; when absent and `insert` is set, the key is added.
    pub fn ok(&self, tx: &TxFingerprint, insert: bool) -> bool {
        let key = tx.key();
        if insert {
            let mut inner = self.inner.write();
            if inner.cache.contains(&key) {
                return false;
            }
            inner.cache.insert(key);
            true
        } else {
            !self.inner.read().cache.contains(&key)
        }
    }

    /// `ok(tx, true)` expressed as a Result, for callers that propagate
    /// admission failures as errors.
    pub fn admit(&self, tx: &TxFingerprint) -> Result<(), LedgerError> {
        if self.ok(tx, true) {
            Ok(())
        } else {
            Err(LedgerError::NonceConflict)
        }
    }

    /// Remove the given transactions' keys, e.g. when a block is dropped
    /// from the pending set.
    pub fn del(&self, txs: &[TxFingerprint]) {
        let mut inner = self.inner.write();
        for tx in txs {
            inner.cache.remove(&tx.key());
        }
    }

    /// Resynchronize the cache with the rolling window ending at the
    /// current chain height.
    ///
    /// The whole operation runs under the write lock. Window bookkeeping
    /// is committed only after every chain read and decode succeeded, so
    /// a failed update leaves the previous window intact and a retry is
    /// safe.
    pub fn update(
        &self,
        chain: &dyn ChainReader,
        codec: &dyn TxKeyCodec,
        rebuild: bool,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();

        let result = Self::update_locked(&mut inner, chain, codec, self.window, rebuild);
        if let Err(ref e) = result {
            tracing::warn!(error = %e, rebuild, "nonce cache update failed, window unchanged");
        }
        result
    }

    fn update_locked(
        inner: &mut Inner,
        chain: &dyn ChainReader,
        codec: &dyn TxKeyCodec,
        window: u64,
        rebuild: bool,
    ) -> Result<(), LedgerError> {
        let head = chain.number()?;

        let pre_start = inner.start_blk;
        let mut pre_end = inner.end_blk;

        let new_end = head;
        let new_start = head.saturating_sub(window);

        tracing::trace!(
            new_start,
            new_end,
            pre_start,
            pre_end,
            rebuild,
            "nonce cache update"
        );

        if rebuild {
            inner.cache.clear();
            pre_end = 0;
        } else {
            // Keys of blocks that slid off the left edge.
            for height in pre_start..new_start {
                for key in block_keys(chain, codec, height)? {
                    inner.cache.remove(&key);
                }
            }
        }

        // Keys of blocks that entered on the right edge (or the whole
        // window on rebuild).
        for height in (pre_end + 1).max(new_start)..=new_end {
            for key in block_keys(chain, codec, height)? {
                inner.cache.insert(key);
            }
        }

        inner.start_blk = new_start;
        inner.end_blk = new_end;

        tracing::trace!(size = inner.cache.len(), "nonce cache updated");
        Ok(())
    }

    /// Current window as (start, end) block heights.
    pub fn window(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (inner.start_blk, inner.end_blk)
    }

    pub fn len(&self) -> usize {
        self.inner.read().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().cache.is_empty()
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

fn block_keys(
    chain: &dyn ChainReader,
    codec: &dyn TxKeyCodec,
    height: u64,
) -> Result<Vec<String>, LedgerError> {
    let hash = chain.number_hash(height)?;
    let txs = chain.transactions(hash)?;
    let mut keys = Vec::with_capacity(txs.len());
    for raw in &txs {
        keys.push(codec.decode(raw)?.key());
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, U256};
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// A chain whose block at height h contains one transaction whose raw
    /// bytes are the height itself; the codec maps those bytes to a
    /// fingerprint with random_id = h.
    struct FlatChain {
        head: Mutex<u64>,
        /// Heights whose reads fail, to exercise the rollback path.
        poisoned: Vec<u64>,
    }

    impl FlatChain {
        fn new(head: u64) -> Self {
            Self {
                head: Mutex::new(head),
                poisoned: Vec::new(),
            }
        }

        fn advance(&self, to: u64) {
            *self.head.lock() = to;
        }
    }

    impl ChainReader for FlatChain {
        fn number(&self) -> Result<u64, LedgerError> {
            Ok(*self.head.lock())
        }

        fn number_hash(&self, height: u64) -> Result<B256, LedgerError> {
            if self.poisoned.contains(&height) {
                return Err(LedgerError::Chain(format!("block {height} unreadable")));
            }
            Ok(B256::with_last_byte(height as u8))
        }

        fn transactions(&self, block_hash: B256) -> Result<Vec<Bytes>, LedgerError> {
            Ok(vec![Bytes::copy_from_slice(&block_hash[31..32])])
        }
    }

    struct ByteCodec;

    impl TxKeyCodec for ByteCodec {
        fn decode(&self, raw: &[u8]) -> Result<TxFingerprint, LedgerError> {
            Ok(TxFingerprint::new(
                Address::repeat_byte(0x11),
                U256::from(raw[0]),
            ))
        }
    }

    fn tx(random_id: u64) -> TxFingerprint {
        TxFingerprint::new(Address::repeat_byte(0x11), U256::from(random_id))
    }

    #[test]
    fn window_slide_drops_left_edge_and_adds_right() {
        // W = 3, blocks 0..=4 each with one tx keyed k0..k4.
        let chain = FlatChain::new(4);
        let cache = NonceCache::with_window(3);
        cache.init(&chain, &ByteCodec).unwrap();

        assert_eq!(cache.window(), (1, 4));
        assert_eq!(cache.len(), 4);
        assert!(!cache.ok(&tx(1), false));
        assert!(!cache.ok(&tx(4), false));
        // k0 never entered (rebuild covers [1, 4] only).
        assert!(cache.ok(&tx(0), false));

        // A block at height 5 commits; incremental update.
        chain.advance(5);
        cache.update(&chain, &ByteCodec, false).unwrap();

        assert_eq!(cache.window(), (2, 5));
        assert_eq!(cache.len(), 4);
        assert!(cache.ok(&tx(1), false), "k1 slid off the left edge");
        for id in 2..=5 {
            assert!(!cache.ok(&tx(id), false), "k{id} must be cached");
        }
    }

    #[test]
    fn short_chain_window_starts_at_zero() {
        let chain = FlatChain::new(4);
        let cache = NonceCache::with_window(1000);
        cache.init(&chain, &ByteCodec).unwrap();
        assert_eq!(cache.window(), (0, 4));
        // Rebuild inserts [max(0+1, 0), 4] — heights 1..=4.
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn rebuild_size_matches_window_population() {
        // H = W + k with k = 2: window [2, 12], 11 blocks of one tx each.
        let chain = FlatChain::new(12);
        let cache = NonceCache::with_window(10);
        cache.init(&chain, &ByteCodec).unwrap();
        assert_eq!(cache.window(), (2, 12));
        assert_eq!(cache.len(), 11);
    }

    #[test]
    fn ok_insert_is_idempotent_in_result() {
        let cache = NonceCache::new();
        assert!(cache.ok(&tx(7), true));
        assert!(!cache.ok(&tx(7), true));
        assert!(!cache.ok(&tx(7), false));
    }

    #[test]
    fn ok_without_insert_has_no_side_effect() {
        let cache = NonceCache::new();
        assert!(cache.ok(&tx(9), false));
        assert!(cache.ok(&tx(9), false));
        assert!(cache.is_empty());
    }

    #[test]
    fn admit_maps_duplicate_to_nonce_conflict() {
        let cache = NonceCache::new();
        cache.admit(&tx(3)).unwrap();
        assert!(matches!(
            cache.admit(&tx(3)),
            Err(LedgerError::NonceConflict)
        ));
    }

    #[test]
    fn del_removes_keys() {
        let cache = NonceCache::new();
        assert!(cache.ok(&tx(1), true));
        assert!(cache.ok(&tx(2), true));
        cache.del(&[tx(1)]);
        assert!(cache.ok(&tx(1), false));
        assert!(!cache.ok(&tx(2), false));
    }

    #[test]
    fn failed_update_leaves_window_for_retry() {
        let mut chain = FlatChain::new(4);
        let cache = NonceCache::with_window(3);
        cache.init(&chain, &ByteCodec).unwrap();
        assert_eq!(cache.window(), (1, 4));

        // Height 5 commits but its block is unreadable.
        chain.advance(5);
        chain.poisoned.push(5);
        assert!(cache.update(&chain, &ByteCodec, false).is_err());
        assert_eq!(cache.window(), (1, 4), "window must not move on failure");

        // Once the block becomes readable, the same update succeeds.
        chain.poisoned.clear();
        cache.update(&chain, &ByteCodec, false).unwrap();
        assert_eq!(cache.window(), (2, 5));
        assert!(!cache.ok(&tx(5), false));
        assert!(cache.ok(&tx(1), false));
    }

    #[test]
    fn cache_equals_window_union_after_updates() {
        let chain = FlatChain::new(6);
        let cache = NonceCache::with_window(4);
        cache.init(&chain, &ByteCodec).unwrap();

        for head in 7..=20 {
            chain.advance(head);
            cache.update(&chain, &ByteCodec, false).unwrap();
            let (start, end) = cache.window();
            assert_eq!(start, head - 4);
            assert_eq!(end, head);
            for id in start.max(1)..=end {
                assert!(!cache.ok(&tx(id), false), "k{id} missing at head {head}");
            }
            if start > 1 {
                assert!(
                    cache.ok(&tx(start - 1), false),
                    "k{} must have slid off at head {head}",
                    start - 1
                );
            }
        }
    }
}
