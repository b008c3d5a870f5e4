use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

pub mod idempotency;
pub mod store;
