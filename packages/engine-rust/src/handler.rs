//! Provider-side operation handlers.

use std::future::Future;

use async_trait::async_trait;
use mal_core::Message;

use crate::transaction::Transaction;

/// Processes the initiating message of one operation.
///
/// The handler answers through `transaction`. Returning `Err` makes the
/// engine send the error on whatever reply slot is still open: a
/// [`MalError`](mal_core::MalError) travels as is, anything else becomes
/// UNKNOWN carrying the error text.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message, transaction: Transaction) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message, Transaction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message, transaction: Transaction) -> anyhow::Result<()> {
        (self)(message, transaction).await
    }
}
