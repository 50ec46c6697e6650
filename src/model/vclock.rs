//! Fixed-width vector clocks and the happens-before comparator.

use serde::{Deserialize, Serialize};

pub type RoutineId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HbRelation {
    Before,
    After,
    Concurrent,
}

/// One counter per routine. Routine `r` lives at index `r - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clock: Vec<u64>,
}

impl VectorClock {
    pub fn new(size: usize) -> Self {
        Self {
            clock: vec![0; size],
        }
    }

    pub fn from_values(values: Vec<u64>) -> Self {
        Self { clock: values }
    }

    pub fn size(&self) -> usize {
        self.clock.len()
    }

    /// Value for routine `r`; routines outside the clock read as zero.
    pub fn get(&self, routine: RoutineId) -> u64 {
        if routine == 0 {
            return 0;
        }
        self.clock.get(routine as usize - 1).copied().unwrap_or(0)
    }

    pub fn inc(&mut self, routine: RoutineId) -> &mut Self {
        if routine == 0 {
            return self;
        }
        let idx = routine as usize - 1;
        if idx >= self.clock.len() {
            self.clock.resize(idx + 1, 0);
        }
        self.clock[idx] = self.clock[idx].saturating_add(1);
        self
    }

    /// Componentwise max, in place.
    pub fn sync(&mut self, other: &VectorClock) -> &mut Self {
        if other.clock.len() > self.clock.len() {
            self.clock.resize(other.clock.len(), 0);
        }
        for (mine, theirs) in self.clock.iter_mut().zip(other.clock.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        self
    }

    pub fn is_zero(&self) -> bool {
        self.clock.iter().all(|v| *v == 0)
    }

    pub fn values(&self) -> &[u64] {
        &self.clock
    }

    /// `self[i] >= other[i]` for every component.
    pub fn ge(&self, other: &VectorClock) -> bool {
        let len = self.clock.len().max(other.clock.len());
        (0..len).all(|i| {
            let a = self.clock.get(i).copied().unwrap_or(0);
            let b = other.clock.get(i).copied().unwrap_or(0);
            a >= b
        })
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.clock.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

/// Equal clocks count as `Before`.
pub fn happens_before(a: &VectorClock, b: &VectorClock) -> HbRelation {
    let len = a.clock.len().max(b.clock.len());
    let mut less = false;
    let mut greater = false;
    for i in 0..len {
        let x = a.clock.get(i).copied().unwrap_or(0);
        let y = b.clock.get(i).copied().unwrap_or(0);
        if x < y {
            less = true;
        } else if x > y {
            greater = true;
        }
        if less && greater {
            return HbRelation::Concurrent;
        }
    }
    if greater {
        HbRelation::After
    } else {
        HbRelation::Before
    }
}

pub fn is_concurrent(a: &VectorClock, b: &VectorClock) -> bool {
    happens_before(a, b) == HbRelation::Concurrent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(values: &[u64]) -> VectorClock {
        VectorClock::from_values(values.to_vec())
    }

    #[test]
    fn sync_with_self_is_identity() {
        let v = vc(&[3, 0, 7]);
        let mut w = v.clone();
        w.sync(&v);
        assert_eq!(v, w);
    }

    #[test]
    fn before_implies_after_in_reverse() {
        let a = vc(&[1, 2, 0]);
        let b = vc(&[1, 3, 4]);
        assert_eq!(happens_before(&a, &b), HbRelation::Before);
        assert_eq!(happens_before(&b, &a), HbRelation::After);
    }

    #[test]
    fn inc_only_touches_its_component() {
        let mut v = vc(&[5, 5, 5]);
        v.inc(2).inc(2);
        assert_eq!(v.values(), &[5, 7, 5]);
        assert_eq!(v.get(2), 7);
        assert_eq!(v.get(9), 0);
    }

    #[test]
    fn sync_is_commutative_and_associative() {
        let a = vc(&[1, 4, 0]);
        let b = vc(&[2, 0, 3]);
        let c = vc(&[0, 5, 1]);

        let mut ab = a.clone();
        ab.sync(&b);
        let mut ba = b.clone();
        ba.sync(&a);
        assert_eq!(ab, ba);

        let mut left = ab.clone();
        left.sync(&c);
        let mut bc = b.clone();
        bc.sync(&c);
        let mut right = a.clone();
        right.sync(&bc);
        assert_eq!(left, right);
    }

    #[test]
    fn before_is_transitive() {
        let a = vc(&[1, 0, 0]);
        let b = vc(&[1, 1, 0]);
        let c = vc(&[2, 1, 1]);
        assert_eq!(happens_before(&a, &b), HbRelation::Before);
        assert_eq!(happens_before(&b, &c), HbRelation::Before);
        assert_eq!(happens_before(&a, &c), HbRelation::Before);
    }

    #[test]
    fn equal_clocks_are_ordered_and_disjoint_updates_are_concurrent() {
        let a = vc(&[2, 2]);
        assert_eq!(happens_before(&a, &a.clone()), HbRelation::Before);
        let b = vc(&[3, 1]);
        assert!(is_concurrent(&a, &b));
        assert!(b.ge(&vc(&[3, 0])));
        assert!(!a.ge(&b));
    }
}
