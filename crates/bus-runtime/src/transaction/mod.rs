//! Transactions: ordered lifecycle callbacks around a unit of work.
//!
//! A transport enlists in the ambient [`TransactionContext`] when it sends or
//! receives. Sends are buffered until commit; the received message is settled
//! in the ack/nack branch, after buffered sends have gone out.

mod ambient;
mod context;
mod items;

pub use ambient::{current, suppress, suppress_sync};
pub use context::{
    Acknowledgement, CallbackFuture, Resolution, TransactionContext, TransactionState,
};
pub use items::TransactionItems;
