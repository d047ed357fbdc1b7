use std::fmt;

/// Stable handle into a [`Slab`].
///
/// The generation is bumped every time a slot is vacated, so a key kept
/// around after its value was removed never resolves to a later occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Packs the key into a poller token.
    pub(crate) fn to_token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub(crate) struct Slab<T> {
    items: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            items: Vec::with_capacity(size),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, item: T) -> Key {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.items[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };

            *slot = Slot::Occupied {
                generation,
                value: item,
            };

            return Key { index, generation };
        }

        let index = self.items.len() as u32;
        self.items.push(Slot::Occupied {
            generation: 0,
            value: item,
        });

        Key {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        match self.items.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.items.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.items.get_mut(key.index as usize)?;

        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let next = Slot::Vacant {
            generation: key.generation.wrapping_add(1),
        };

        let item = match std::mem::replace(slot, next) {
            Slot::Occupied { value, .. } => value,
            Slot::Vacant { .. } => unreachable!(),
        };

        self.free.push(key.index);
        self.len -= 1;

        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_key_does_not_resolve_after_reuse() {
        let mut slab = Slab::new(4);
        let first = slab.insert("first");
        assert_eq!(slab.remove(first), Some("first"));

        let second = slab.insert("second");
        assert_eq!(first.index, second.index);
        assert_ne!(first, second);
        assert!(slab.get(first).is_none());
        assert_eq!(slab.get(second), Some(&"second"));
        assert_eq!(slab.remove(first), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn token_round_trip_keeps_generation() {
        let mut slab = Slab::new(1);
        let key = slab.insert(1u8);
        slab.remove(key);
        let key = slab.insert(2u8);

        assert_eq!(Key::from_token(key.to_token()), key);
    }
}
