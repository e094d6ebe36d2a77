//! Record implementations for dynamic containers
//!
//! Sequences and associative containers encode as a varint element count
//! followed by the element (or key/value pair) encodings. The count is
//! capped to protect replay from corrupted count fields.
//!
//! A container read that runs out of input may leave the container
//! partially rebuilt; the framed reader always retries the whole record
//! against a larger window, which starts with a fresh `clear()`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};

use crate::error::{StoreError, StoreResult};
use crate::primitives::{varuint_size, VarUint};
use crate::serial::{compose_read, compose_write, Reader, Record};

/// Protects replay against corrupted element-count fields.
pub const MAX_ITEMS: usize = 256 * 1024 * 1024;

fn check_write_count(count: usize) -> StoreResult<()> {
    if count > MAX_ITEMS {
        return Err(StoreError::Oversized {
            size: count as u64,
            limit: MAX_ITEMS as u64,
            kind: "container items",
        });
    }
    Ok(())
}

fn read_count(r: &mut Reader<'_>) -> StoreResult<usize> {
    let mut len = VarUint(0u64);
    r.read(&mut len)?;
    if len.0 > MAX_ITEMS as u64 {
        return Err(StoreError::Decode {
            reason: format!("container count {} exceeds cap {}", len.0, MAX_ITEMS),
        });
    }
    Ok(len.0 as usize)
}

fn write_elements<'a, T, I>(dst: &mut [u8], count: usize, elems: I) -> StoreResult<usize>
where
    T: Record + 'a,
    I: IntoIterator<Item = &'a T>,
{
    check_write_count(count)?;
    compose_write(dst, |w| {
        w.write(&VarUint(count as u64))?;
        for elem in elems {
            w.write(elem)?;
        }
        Ok(())
    })
}

fn write_pairs<'a, K, V, I>(dst: &mut [u8], count: usize, pairs: I) -> StoreResult<usize>
where
    K: Record + 'a,
    V: Record + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    check_write_count(count)?;
    compose_write(dst, |w| {
        w.write(&VarUint(count as u64))?;
        for (k, v) in pairs {
            w.write(k)?;
            w.write(v)?;
        }
        Ok(())
    })
}

fn elements_size<'a, T, I>(count: usize, elems: I) -> usize
where
    T: Record + 'a,
    I: IntoIterator<Item = &'a T>,
{
    varuint_size(count as u64) + elems.into_iter().map(Record::encoded_size).sum::<usize>()
}

fn pairs_size<'a, K, V, I>(count: usize, pairs: I) -> usize
where
    K: Record + 'a,
    V: Record + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    varuint_size(count as u64)
        + pairs
            .into_iter()
            .map(|(k, v)| k.encoded_size() + v.encoded_size())
            .sum::<usize>()
}

// ----------------------------------------------------------------------------
// Sequences
// ----------------------------------------------------------------------------

macro_rules! sequence_record {
    ($container:ident) => {
        impl<T: Record> Record for $container<T> {
            fn empty() -> Self {
                $container::new()
            }

            fn encoded_size(&self) -> usize {
                elements_size(self.len(), self.iter())
            }

            fn is_empty(&self) -> bool {
                self.len() == 0
            }

            fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
                write_elements(dst, self.len(), self.iter())
            }

            fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
                compose_read(src, |r| {
                    let count = read_count(r)?;
                    self.clear();
                    self.reserve(count);
                    for _ in 0..count {
                        let mut elem = T::empty();
                        r.read(&mut elem)?;
                        self.push_back_elem(elem);
                    }
                    Ok(())
                })
            }
        }
    };
}

// Uniform push name for the sequence macro.
trait PushBack<T> {
    fn push_back_elem(&mut self, elem: T);
}

impl<T> PushBack<T> for Vec<T> {
    fn push_back_elem(&mut self, elem: T) {
        self.push(elem);
    }
}

impl<T> PushBack<T> for VecDeque<T> {
    fn push_back_elem(&mut self, elem: T) {
        self.push_back(elem);
    }
}

sequence_record!(Vec);
sequence_record!(VecDeque);

// ----------------------------------------------------------------------------
// Maps
// ----------------------------------------------------------------------------

macro_rules! map_read_body {
    ($self:ident, $src:ident) => {
        compose_read($src, |r| {
            let count = read_count(r)?;
            $self.clear();
            for _ in 0..count {
                let mut key = K::empty();
                let mut value = V::empty();
                r.read(&mut key)?;
                r.read(&mut value)?;
                $self.insert(key, value);
            }
            Ok(())
        })
    };
}

impl<K, V, S> Record for HashMap<K, V, S>
where
    K: Record + Eq + Hash,
    V: Record,
    S: BuildHasher + Default,
{
    fn empty() -> Self {
        HashMap::with_hasher(S::default())
    }

    fn encoded_size(&self) -> usize {
        pairs_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_pairs(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        map_read_body!(self, src)
    }
}

impl<K, V, S> Record for hashbrown::HashMap<K, V, S>
where
    K: Record + Eq + Hash,
    V: Record,
    S: BuildHasher + Default,
{
    fn empty() -> Self {
        hashbrown::HashMap::with_hasher(S::default())
    }

    fn encoded_size(&self) -> usize {
        pairs_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_pairs(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        map_read_body!(self, src)
    }
}

impl<K, V> Record for BTreeMap<K, V>
where
    K: Record + Ord,
    V: Record,
{
    fn empty() -> Self {
        BTreeMap::new()
    }

    fn encoded_size(&self) -> usize {
        pairs_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_pairs(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        map_read_body!(self, src)
    }
}

// ----------------------------------------------------------------------------
// Sets
// ----------------------------------------------------------------------------

macro_rules! set_read_body {
    ($self:ident, $src:ident) => {
        compose_read($src, |r| {
            let count = read_count(r)?;
            $self.clear();
            for _ in 0..count {
                let mut elem = K::empty();
                r.read(&mut elem)?;
                $self.insert(elem);
            }
            Ok(())
        })
    };
}

impl<K, S> Record for HashSet<K, S>
where
    K: Record + Eq + Hash,
    S: BuildHasher + Default,
{
    fn empty() -> Self {
        HashSet::with_hasher(S::default())
    }

    fn encoded_size(&self) -> usize {
        elements_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_elements(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        set_read_body!(self, src)
    }
}

impl<K, S> Record for hashbrown::HashSet<K, S>
where
    K: Record + Eq + Hash,
    S: BuildHasher + Default,
{
    fn empty() -> Self {
        hashbrown::HashSet::with_hasher(S::default())
    }

    fn encoded_size(&self) -> usize {
        elements_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_elements(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        set_read_body!(self, src)
    }
}

impl<K: Record + Ord> Record for BTreeSet<K> {
    fn empty() -> Self {
        BTreeSet::new()
    }

    fn encoded_size(&self) -> usize {
        elements_size(self.len(), self.iter())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_elements(dst, self.len(), self.iter())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        set_read_body!(self, src)
    }
}
