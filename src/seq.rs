//! Chainable lazy sequences.
//!
//! [`Seq`] wraps any iterator and exposes the small pipeline vocabulary used by
//! the registry lookups and the kubeconfig merge. Adapters return a new `Seq`
//! and do no work; only [`find`](Seq::find), [`join`](Seq::join) and
//! [`collect_with`](Seq::collect_with) pull items, and they consume the input
//! at most once.

use std::fmt::{Display, Write};
use std::iter;

/// A lazy, single-pass sequence.
#[derive(Debug, Clone)]
#[must_use = "sequences are lazy and do nothing unless consumed"]
pub struct Seq<I> {
    inner: I,
}

/// Starts a lazy pipeline over `source`.
pub fn seq<T: IntoIterator>(source: T) -> Seq<T::IntoIter> {
    Seq {
        inner: source.into_iter(),
    }
}

impl<I: Iterator> Seq<I> {
    pub fn map<B, F>(self, f: F) -> Seq<iter::Map<I, F>>
    where
        F: FnMut(I::Item) -> B,
    {
        Seq {
            inner: self.inner.map(f),
        }
    }

    pub fn filter<P>(self, predicate: P) -> Seq<iter::Filter<I, P>>
    where
        P: FnMut(&I::Item) -> bool,
    {
        Seq {
            inner: self.inner.filter(predicate),
        }
    }

    /// Maps every item and drops the ones that map to `None`.
    pub fn filter_map<B, F>(self, f: F) -> Seq<iter::FilterMap<I, F>>
    where
        F: FnMut(I::Item) -> Option<B>,
    {
        Seq {
            inner: self.inner.filter_map(f),
        }
    }

    pub fn flat_map<U, F>(self, f: F) -> Seq<iter::FlatMap<I, U, F>>
    where
        U: IntoIterator,
        F: FnMut(I::Item) -> U,
    {
        Seq {
            inner: self.inner.flat_map(f),
        }
    }

    /// Returns the first item matching `predicate`, stopping there.
    pub fn find<P>(mut self, predicate: P) -> Option<I::Item>
    where
        P: FnMut(&I::Item) -> bool,
    {
        self.inner.find(predicate)
    }

    /// Renders every item with `Display` and joins them with `separator`.
    pub fn join(self, separator: &str) -> String
    where
        I::Item: Display,
    {
        let mut out = String::new();
        for (index, item) in self.inner.enumerate() {
            if index > 0 {
                out.push_str(separator);
            }
            // Writing to a String cannot fail.
            let _ = write!(out, "{item}");
        }
        out
    }

    /// Materializes the sequence with a caller-supplied reducer.
    pub fn collect_with<R, F>(self, reducer: F) -> R
    where
        F: FnOnce(I) -> R,
    {
        reducer(self.inner)
    }
}

impl<I: Iterator> Iterator for Seq<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::seq;

    #[test]
    fn adapters_do_no_work_until_consumed() {
        let calls = Cell::new(0);
        let pipeline = seq([1, 2, 3]).map(|x| {
            calls.set(calls.get() + 1);
            x * 2
        });
        assert_eq!(calls.get(), 0);

        let doubled: Vec<_> = pipeline.collect_with(|items| items.collect());
        assert_eq!(doubled, vec![2, 4, 6]);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn find_short_circuits() {
        let calls = Cell::new(0);
        let found = seq(1..)
            .map(|x| {
                calls.set(calls.get() + 1);
                x
            })
            .find(|x| *x == 3);
        assert_eq!(found, Some(3));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn filter_map_drops_none() {
        let parsed: Vec<i32> = seq(["1", "x", "3"])
            .filter_map(|s| s.parse().ok())
            .collect();
        assert_eq!(parsed, vec![1, 3]);
    }

    #[test]
    fn flat_map_and_join() {
        let joined = seq([vec!["a", "b"], vec![], vec!["c"]])
            .flat_map(|v| v)
            .filter(|s| *s != "b")
            .join("/");
        assert_eq!(joined, "a/c");
        assert_eq!(seq(Vec::<u8>::new()).join(","), "");
    }
}
