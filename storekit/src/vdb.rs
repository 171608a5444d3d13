//! The VDB contract: a namespaced store of `(id, vector)` pairs with
//! brute-force nearest-neighbor search. Namespacing is a property of how a
//! VDB instance is constructed (§4.7/§4.8), not a parameter of these
//! methods: two `Vdb` instances for different namespaces are distinct
//! objects even if they share a backing KVDB or remote database.

use crate::error::CResult;

/// One item yielded by `Vdb::all`, mirroring `kvdb::ScanItem`'s lazy-value
/// design: the id is available up front, and fetching the vector is a
/// separate step so a caller that only wants ids never pays for them.
pub struct VectorItem {
    pub id: String,
    value_fn: Box<dyn FnOnce() -> CResult<Vec<f32>> + Send>,
}

impl VectorItem {
    pub fn new(id: String, value_fn: impl FnOnce() -> CResult<Vec<f32>> + Send + 'static) -> Self {
        Self { id, value_fn: Box::new(value_fn) }
    }

    pub fn value(self) -> CResult<Vec<f32>> {
        (self.value_fn)()
    }
}

pub type VectorIter<'a> = Box<dyn Iterator<Item = CResult<VectorItem>> + 'a>;

/// A single search hit: an id, its similarity score (dot product against
/// the query), and its vector is retrievable again via `Vdb::get` if
/// needed.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
}

pub trait Vdb: Send + Sync {
    /// Sets the vector for `id`, replacing any prior value. An empty id is
    /// a fatal programmer error.
    fn set(&self, id: &str, vector: Vec<f32>) -> CResult<()>;

    fn get(&self, id: &str) -> CResult<Option<Vec<f32>>>;

    /// Deleting an absent id is a no-op.
    fn delete(&self, id: &str) -> CResult<()>;

    /// Iterates every live id in lexicographic order.
    fn all(&self) -> VectorIter<'_>;

    /// Returns at most `n` results, sorted by score descending, ties broken
    /// by id ascending. Vectors whose length disagrees with `target`'s are
    /// skipped rather than erroring.
    fn search(&self, target: &[f32], n: usize) -> CResult<Vec<SearchResult>>;

    fn batch(&self) -> Box<dyn VdbBatch + '_>;

    fn flush(&self) -> CResult<()>;

    /// Releases whatever resources this backend holds, mirroring
    /// `Kvdb::close`. The default just flushes.
    fn close(&self) -> CResult<()> {
        self.flush()
    }
}

pub trait VdbBatch {
    fn set(&mut self, id: &str, vector: Vec<f32>);
    fn delete(&mut self, id: &str);
    fn maybe_apply(&mut self) -> CResult<bool>;
    fn apply(&mut self) -> CResult<()>;
}

/// Dot product of two equal-length vectors; the similarity metric used by
/// every `Vdb::search` implementation in this crate.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Maintains the top-`n` `SearchResult`s seen so far, ordered by score
/// descending with id ascending as a tiebreak. Shared by the in-memory and
/// remote VDBs so the ranking rule can't drift between them.
pub struct TopK {
    n: usize,
    results: Vec<SearchResult>,
}

impl TopK {
    pub fn new(n: usize) -> Self {
        Self { n, results: Vec::with_capacity(n) }
    }

    pub fn offer(&mut self, id: String, score: f32) {
        let pos = self
            .results
            .binary_search_by(|r| cmp_score_then_id(r, score, &id))
            .unwrap_or_else(|p| p);
        if pos < self.n {
            self.results.insert(pos, SearchResult { id, score });
            if self.results.len() > self.n {
                self.results.truncate(self.n);
            }
        }
    }

    pub fn into_vec(self) -> Vec<SearchResult> {
        self.results
    }
}

fn cmp_score_then_id(existing: &SearchResult, score: f32, id: &str) -> std::cmp::Ordering {
    // Descending score, then ascending id: the vector stays sorted so a
    // plain binary_search + insert keeps the top-n without a heap.
    // `existing` compares against the incoming `(score, id)` in the same
    // order the vector is kept in, so `binary_search_by` locates the
    // correct insertion point directly.
    match existing.score.partial_cmp(&score) {
        Some(std::cmp::Ordering::Greater) => std::cmp::Ordering::Less,
        Some(std::cmp::Ordering::Less) => std::cmp::Ordering::Greater,
        _ => existing.id.as_str().cmp(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_orders_by_score_desc_id_asc() {
        let mut top = TopK::new(3);
        top.offer("b".into(), 1.0);
        top.offer("a".into(), 1.0);
        top.offer("c".into(), 2.0);
        top.offer("d".into(), 0.5);
        let results = top.into_vec();
        assert_eq!(
            results,
            vec![
                SearchResult { id: "c".into(), score: 2.0 },
                SearchResult { id: "a".into(), score: 1.0 },
                SearchResult { id: "b".into(), score: 1.0 },
            ]
        );
    }

    #[test]
    fn top_k_drops_beyond_n() {
        let mut top = TopK::new(2);
        for (id, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            top.offer(id.into(), score);
        }
        let results = top.into_vec();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "c");
        assert_eq!(results[1].id, "b");
    }

    #[test]
    fn dot_product() {
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }
}
