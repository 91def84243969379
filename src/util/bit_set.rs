use std::fmt::{Debug, Formatter};

/// Growable set of small unsigned integers (register numbers, block ids)
///
/// Membership is stored one bit per element in 64-bit words. Inserting an element past the current
/// capacity grows the set, so two sets built over different register frames can still be compared
/// and unioned.
#[derive(Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// New empty set
    pub fn new() -> BitSet {
        BitSet { words: vec![] }
    }

    /// Set containing every element in `0..len`
    pub fn full(len: usize) -> BitSet {
        let mut set = BitSet {
            words: vec![0; (len + 63) / 64],
        };
        for elem in 0..len {
            set.insert(elem);
        }
        set
    }

    /// Add an element, returning whether it was newly added
    pub fn insert(&mut self, elem: usize) -> bool {
        let (word, bit) = (elem / 64, elem % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & (1u64 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was_set
    }

    /// Remove an element, returning whether it was present
    pub fn remove(&mut self, elem: usize) -> bool {
        let (word, bit) = (elem / 64, elem % 64);
        match self.words.get_mut(word) {
            Some(w) if *w & (1u64 << bit) != 0 => {
                *w &= !(1u64 << bit);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, elem: usize) -> bool {
        let (word, bit) = (elem / 64, elem % 64);
        self.words.get(word).map_or(false, |w| w & (1u64 << bit) != 0)
    }

    /// Union `other` into `self`, returning whether `self` changed
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            let merged = *mine | *theirs;
            changed |= merged != *mine;
            *mine = merged;
        }
        changed
    }

    /// Remove every element of `other` from `self`
    pub fn difference_with(&mut self, other: &BitSet) {
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine &= !*theirs;
        }
    }

    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.words.iter().enumerate().all(|(idx, word)| {
            let theirs = other.words.get(idx).copied().unwrap_or(0);
            word & !theirs == 0
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Elements in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| idx * 64 + bit)
        })
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &BitSet) -> bool {
        self.is_subset(other) && other.is_subset(self)
    }
}

impl Eq for BitSet {}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(elems: I) -> Self {
        let mut set = BitSet::new();
        for elem in elems {
            set.insert(elem);
        }
        set
    }
}

impl Debug for BitSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let mut set = BitSet::new();
        assert!(set.insert(3));
        assert!(set.insert(130));
        assert!(!set.insert(3));
        assert!(set.contains(130));
        assert!(!set.contains(4));
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![130]);
    }

    #[test]
    fn union_reports_change() {
        let mut left: BitSet = vec![1, 2].into_iter().collect();
        let right: BitSet = vec![2, 70].into_iter().collect();
        assert!(left.union_with(&right));
        assert!(!left.union_with(&right));
        assert_eq!(left.iter().collect::<Vec<_>>(), vec![1, 2, 70]);
    }

    #[test]
    fn equality_ignores_capacity() {
        let mut grown: BitSet = vec![1, 200].into_iter().collect();
        grown.remove(200);
        let small: BitSet = vec![1].into_iter().collect();
        assert_eq!(grown, small);
        assert!(small.is_subset(&BitSet::full(4)));
        assert_eq!(BitSet::full(4).len(), 4);
    }
}
