//! User supplied functions: transformers, collators and finalizers.
//!
//! All three are cheap to clone and can be shipped to every node taking
//! part in an operation.

use crate::error::Result;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type CollateFn<I, R> = dyn Fn(BoxStream<'static, I>) -> BoxFuture<'static, Result<R>> + Send + Sync;

type TransformFn<I, R> = dyn Fn(BoxStream<'static, I>) -> BoxStream<'static, Result<R>> + Send + Sync;

/// Reduces a sequence of items to a single value.
pub struct Collator<I, R> {
    f: Arc<CollateFn<I, R>>,
}

/// Reduces the sequence of partial values to one final value.
pub type Finalizer<R> = Collator<R, R>;

impl<I: Send + 'static, R: Send + 'static> Collator<I, R> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(BoxStream<'static, I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |items| f(items).boxed()),
        }
    }

    /// Run the collator over `items`.
    pub fn collate(&self, items: BoxStream<'static, I>) -> BoxFuture<'static, Result<R>> {
        (self.f)(items)
    }

    /// Run the collator over an in-memory batch.
    pub fn collate_iter<T>(&self, items: T) -> BoxFuture<'static, Result<R>>
    where
        T: IntoIterator<Item = I>,
        T::IntoIter: Send + 'static,
    {
        self.collate(stream::iter(items).boxed())
    }
}

impl<I, R> Clone for Collator<I, R> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<I, R> fmt::Debug for Collator<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collator").finish_non_exhaustive()
    }
}

/// Maps a sequence of items to a sequence of values, possibly of a
/// different length.
pub struct Transformer<I, R> {
    f: Arc<TransformFn<I, R>>,
}

impl<I: Send + 'static, R: Send + 'static> Transformer<I, R> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(BoxStream<'static, I>) -> BoxStream<'static, Result<R>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// A transformer applying `f` to every item.
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |items| {
            let f = f.clone();
            items.map(move |item| Ok(f(item))).boxed()
        })
    }

    /// A transformer expanding every item into zero or more values.
    pub fn flat_map<F, It>(f: F) -> Self
    where
        F: Fn(I) -> It + Send + Sync + 'static,
        It: IntoIterator<Item = R>,
        It::IntoIter: Send + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |items| {
            let f = f.clone();
            items
                .flat_map(move |item| stream::iter(f(item)).map(Ok))
                .boxed()
        })
    }

    pub fn apply(&self, items: BoxStream<'static, I>) -> BoxStream<'static, Result<R>> {
        (self.f)(items)
    }
}

impl<I: Send + 'static> Transformer<I, I> {
    pub fn identity() -> Self {
        Self::new(|items| items.map(Ok).boxed())
    }
}

impl<I, R> Clone for Transformer<I, R> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<I, R> fmt::Debug for Transformer<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer").finish_non_exhaustive()
    }
}
