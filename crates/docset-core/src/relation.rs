//! Many-to-many association with both directions indexed.
//!
//! Used for node ↔ document and document ↔ tag membership. All mutation
//! goes through `&mut self` methods that update both maps together, so the
//! forward and reverse views cannot drift apart.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct Relation<L: Ord + Copy, R: Ord + Copy> {
    forward: BTreeMap<L, BTreeSet<R>>,
    reverse: BTreeMap<R, BTreeSet<L>>,
}

impl<L: Ord + Copy, R: Ord + Copy> Default for Relation<L, R> {
    fn default() -> Self {
        Self {
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
        }
    }
}

impl<L: Ord + Copy, R: Ord + Copy> Relation<L, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `left` and `right`. Returns `false` if they were already linked.
    pub fn insert(&mut self, left: L, right: R) -> bool {
        let added = self.forward.entry(left).or_default().insert(right);
        self.reverse.entry(right).or_default().insert(left);
        added
    }

    pub fn contains(&self, left: L, right: R) -> bool {
        self.forward
            .get(&left)
            .map(|rs| rs.contains(&right))
            .unwrap_or(false)
    }

    /// All right-hand values linked to `left`, ascending.
    pub fn right_of(&self, left: L) -> Vec<R> {
        self.forward
            .get(&left)
            .map(|rs| rs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All left-hand values linked to `right`, ascending.
    pub fn left_of(&self, right: R) -> Vec<L> {
        self.reverse
            .get(&right)
            .map(|ls| ls.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replaces every link of `left` with exactly `rights`.
    pub fn replace_right_of(&mut self, left: L, rights: impl IntoIterator<Item = R>) {
        self.remove_left(left);
        for r in rights {
            self.insert(left, r);
        }
    }

    /// Drops `left` and all of its links.
    pub fn remove_left(&mut self, left: L) {
        if let Some(rights) = self.forward.remove(&left) {
            for r in rights {
                if let Some(ls) = self.reverse.get_mut(&r) {
                    ls.remove(&left);
                    if ls.is_empty() {
                        self.reverse.remove(&r);
                    }
                }
            }
        }
    }

    /// Drops `right` and all of its links.
    pub fn remove_right(&mut self, right: R) {
        if let Some(lefts) = self.reverse.remove(&right) {
            for l in lefts {
                if let Some(rs) = self.forward.get_mut(&l) {
                    rs.remove(&right);
                    if rs.is_empty() {
                        self.forward.remove(&l);
                    }
                }
            }
        }
    }

    /// Every `(left, right)` pair, ordered by left then right.
    pub fn pairs(&self) -> impl Iterator<Item = (L, R)> + '_ {
        self.forward
            .iter()
            .flat_map(|(l, rs)| rs.iter().map(move |r| (*l, *r)))
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
