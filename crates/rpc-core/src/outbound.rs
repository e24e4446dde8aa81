//! A minimal send-a-message abstraction shared by the request, call, and
//! event engines, so none of them needs to know about message id minting or
//! the egress queue directly. Hand-rolled rather than `async fn` in a trait,
//! so it stays usable behind `Arc<dyn Outbound>` (mirrors [`crate::stream::StreamOutbound`]).

use std::future::Future;
use std::pin::Pin;

use crate::error::ProcessorError;
use crate::message::{Message, Priority};

pub trait Outbound: Send + Sync + 'static {
    fn send(
        &self,
        message: Message,
        priority: Priority,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + '_>>;
}
