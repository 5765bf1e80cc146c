//! Ready-made collators and finalizers.
//!
//! Collators reduce the items of one target; finalizers combine the
//! partial results. Most reductions pair one of each:
//!
//! | reduction | collator          | finalizer             |
//! |-----------|-------------------|-----------------------|
//! | count     | [`count`]         | [`add`]               |
//! | collect   | [`to_vec`]        | [`concat_vecs`]       |
//! | any       | [`any_match`]     | [`or`]                |
//! | all       | [`all_match`]     | [`and`]               |
//! | none      | [`none_match`]    | [`and`]               |
//! | first     | [`find_first`]    | [`skip_none`]`(find_first())` |
//! | min / max | [`min_by`]        | [`skip_none`]`(min_by(..))`   |

use crate::functions::{Collator, Finalizer};
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::cmp::Ordering;
use std::sync::Arc;

/// Number of items.
pub fn count<I: Send + 'static>() -> Collator<I, u64> {
    Collator::new(|mut items: BoxStream<'static, I>| async move {
        let mut count = 0u64;
        while items.next().await.is_some() {
            count += 1;
        }
        Ok(count)
    })
}

/// Sum of counts.
pub fn add() -> Finalizer<u64> {
    reduce(0, |a, b| a + b)
}

/// Fold items with `op`, starting from `identity`.
pub fn reduce<T, F>(identity: T, op: F) -> Collator<T, T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    let op = Arc::new(op);
    Collator::new(move |mut items: BoxStream<'static, T>| {
        let op = op.clone();
        let identity = identity.clone();
        async move {
            let mut acc = identity;
            while let Some(item) = items.next().await {
                acc = op(acc, item);
            }
            Ok(acc)
        }
    })
}

/// Fold items with `op`. `None` when there are no items.
pub fn reduce_opt<T, F>(op: F) -> Collator<T, Option<T>>
where
    T: Send + 'static,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    let op = Arc::new(op);
    Collator::new(move |mut items: BoxStream<'static, T>| {
        let op = op.clone();
        async move {
            let mut acc = None;
            while let Some(item) = items.next().await {
                acc = Some(match acc {
                    Some(acc) => op(acc, item),
                    None => item,
                });
            }
            Ok(acc)
        }
    })
}

/// Turn a collator producing an optional value into a finalizer that
/// ignores absent partial results.
pub fn skip_none<T: Send + 'static>(collator: Collator<T, Option<T>>) -> Finalizer<Option<T>> {
    Collator::new(move |partials: BoxStream<'static, Option<T>>| {
        collator.collate(partials.filter_map(future::ready).boxed())
    })
}

/// Accumulate items into a container created by `supplier`.
pub fn collect<I, C, S, A>(supplier: S, accumulator: A) -> Collator<I, C>
where
    I: Send + 'static,
    C: Send + 'static,
    S: Fn() -> C + Send + Sync + 'static,
    A: Fn(&mut C, I) + Send + Sync + 'static,
{
    let supplier = Arc::new(supplier);
    let accumulator = Arc::new(accumulator);
    Collator::new(move |mut items: BoxStream<'static, I>| {
        let mut container = supplier();
        let accumulator = accumulator.clone();
        async move {
            while let Some(item) = items.next().await {
                accumulator(&mut container, item);
            }
            Ok(container)
        }
    })
}

pub fn to_vec<I: Send + 'static>() -> Collator<I, Vec<I>> {
    collect(Vec::new, |items: &mut Vec<I>, item| items.push(item))
}

pub fn concat_vecs<T: Send + 'static>() -> Finalizer<Vec<T>> {
    collect(Vec::new, |all: &mut Vec<T>, mut part: Vec<T>| all.append(&mut part))
}

/// Whether any item matches. Stops reading at the first match.
pub fn any_match<I, P>(predicate: P) -> Collator<I, bool>
where
    I: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    Collator::new(move |mut items: BoxStream<'static, I>| {
        let predicate = predicate.clone();
        async move {
            while let Some(item) = items.next().await {
                if predicate(&item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    })
}

/// Whether every item matches. Stops reading at the first mismatch.
pub fn all_match<I, P>(predicate: P) -> Collator<I, bool>
where
    I: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let any_mismatch = any_match(move |item: &I| !predicate(item));
    Collator::new(move |items: BoxStream<'static, I>| {
        let mismatch = any_mismatch.collate(items);
        async move { mismatch.await.map(|found| !found) }
    })
}

pub fn none_match<I, P>(predicate: P) -> Collator<I, bool>
where
    I: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let any = any_match(predicate);
    Collator::new(move |items: BoxStream<'static, I>| {
        let found = any.collate(items);
        async move { found.await.map(|found| !found) }
    })
}

pub fn or() -> Finalizer<bool> {
    any_match(|value: &bool| *value)
}

pub fn and() -> Finalizer<bool> {
    all_match(|value: &bool| *value)
}

/// The first item, if any.
pub fn find_first<I: Send + 'static>() -> Collator<I, Option<I>> {
    Collator::new(|mut items: BoxStream<'static, I>| async move { Ok(items.next().await) })
}

/// The smallest item according to `compare`.
pub fn min_by<T, F>(compare: F) -> Collator<T, Option<T>>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    reduce_opt(move |a, b| match compare(&a, &b) {
        Ordering::Greater => b,
        _ => a,
    })
}

/// The largest item according to `compare`.
pub fn max_by<T, F>(compare: F) -> Collator<T, Option<T>>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    reduce_opt(move |a, b| match compare(&a, &b) {
        Ordering::Less => b,
        _ => a,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    async fn run<I: Send + 'static, R: Send + 'static>(collator: Collator<I, R>, items: Vec<I>) -> Result<R> {
        collator.collate_iter(items).await
    }

    #[tokio::test]
    async fn test_count_and_add() {
        assert_eq!(run(count(), vec!["a", "b", "c"]).await.unwrap(), 3);
        assert_eq!(run(count::<u32>(), vec![]).await.unwrap(), 0);
        assert_eq!(run(add(), vec![3, 4]).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_vectors() {
        assert_eq!(run(to_vec(), vec![1, 2]).await.unwrap(), vec![1, 2]);
        let all = run(concat_vecs(), vec![vec![1], vec![], vec![2, 3]]).await.unwrap();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_matching() {
        assert!(run(any_match(|x: &u32| *x > 2), vec![1, 3]).await.unwrap());
        assert!(!run(any_match(|x: &u32| *x > 5), vec![1, 3]).await.unwrap());
        assert!(run(all_match(|x: &u32| *x > 0), vec![1, 3]).await.unwrap());
        assert!(run(all_match(|x: &u32| *x > 0), vec![]).await.unwrap());
        assert!(run(none_match(|x: &u32| *x == 2), vec![1, 3]).await.unwrap());

        assert!(run(or(), vec![false, true]).await.unwrap());
        assert!(!run(or(), vec![]).await.unwrap());
        assert!(!run(and(), vec![true, false]).await.unwrap());
    }

    #[tokio::test]
    async fn test_optional_reductions() {
        assert_eq!(run(find_first(), vec![4, 5]).await.unwrap(), Some(4));
        assert_eq!(run(find_first::<u32>(), vec![]).await.unwrap(), None);
        assert_eq!(run(min_by(u32::cmp), vec![4, 2, 9]).await.unwrap(), Some(2));
        assert_eq!(run(max_by(u32::cmp), vec![4, 2, 9]).await.unwrap(), Some(9));

        let finalizer = skip_none(max_by(u32::cmp));
        assert_eq!(run(finalizer, vec![None, Some(3), Some(8)]).await.unwrap(), Some(8));

        let sum = skip_none(reduce_opt(|a: u32, b| a + b));
        assert_eq!(run(sum, vec![Some(1), None, Some(2)]).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_collect_into_set() {
        let distinct = collect(std::collections::BTreeSet::new, |set: &mut std::collections::BTreeSet<u32>, x| {
            set.insert(x);
        });
        let set = run(distinct, vec![3, 1, 3]).await.unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
