//! Bounded top-K result collection, ordered by similarity.

use parking_lot::Mutex;

use crate::types::ID;

/// A single scored match.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub id: ID,
    pub similarity: f32,
}

impl std::fmt::Display for Neighbor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {:.4})", self.id, self.similarity)
    }
}

#[derive(Debug, Default)]
struct ResultSetInner {
    sims: Vec<f32>,
    ids: Vec<ID>,
}

/// At most `k` results in non-increasing similarity order, deduplicated by
/// id. Additions are safe from multiple threads; a single mutex guards the
/// whole set.
#[derive(Debug)]
pub struct ResultSet {
    k: usize,
    inner: Mutex<ResultSetInner>,
}

impl ResultSet {
    pub fn new(top_k: usize) -> Self {
        ResultSet {
            k: top_k,
            inner: Mutex::new(ResultSetInner {
                sims: Vec::with_capacity(top_k),
                ids: Vec::with_capacity(top_k),
            }),
        }
    }

    /// Offers `(id, sim)` to the set. Returns true when the result was
    /// inserted; an id already present keeps its existing entry, and a
    /// similarity not beating the current minimum of a full set is dropped.
    pub fn add_result(&self, id: ID, sim: f32) -> bool {
        let mut inner = self.inner.lock();
        if inner.ids.len() == self.k {
            match inner.sims.last() {
                Some(&last) if last >= sim => return false,
                None => return false, // k == 0
                _ => {}
            }
        }
        if inner.ids.contains(&id) {
            return false;
        }
        let insert = inner
            .sims
            .iter()
            .position(|&s| s < sim)
            .unwrap_or(inner.sims.len());
        if insert == self.k {
            return false;
        }
        inner.sims.insert(insert, sim);
        inner.ids.insert(insert, id);
        inner.sims.truncate(self.k);
        inner.ids.truncate(self.k);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents, best match first.
    pub fn to_vec(&self) -> Vec<Neighbor> {
        let inner = self.inner.lock();
        inner
            .ids
            .iter()
            .zip(&inner.sims)
            .map(|(&id, &similarity)| Neighbor { id, similarity })
            .collect()
    }

    /// Fraction of `baseline`'s best `at` ids that also appear in this set's
    /// best `at` ids.
    pub fn compute_recall(&self, baseline: &ResultSet, at: usize) -> f64 {
        let mine = self.to_vec();
        let base = baseline.to_vec();
        let found = base
            .iter()
            .take(at)
            .filter(|b| mine.iter().take(at).any(|n| n.id == b.id))
            .count();
        found as f64 / at as f64
    }
}

impl std::fmt::Display for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let neighbors = self.to_vec();
        let mut first = true;
        write!(f, "[")?;
        for n in neighbors {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", n)?;
            first = false;
        }
        write!(f, "]")
    }
}
