//! In-process publishing into a [`Broker`].

use mal_core::{AbstractElement, Element, UpdateHeader};

use super::{check_lengths, Broker, UpdateOrigin};
use crate::error::EngineResult;

/// Publishes into a broker without going through a transport.
///
/// Local publishes skip publisher registration and key declaration, and
/// share the broker's matching and fan-out. Validation errors are returned
/// to the caller instead of being sent as PUBLISH_ERROR.
#[derive(Debug, Clone)]
pub struct LocalBroker {
    broker: Broker,
    origin: UpdateOrigin,
}

impl LocalBroker {
    /// Publishes on behalf of `origin` (domain, session and operation).
    #[must_use]
    pub fn new(broker: Broker, origin: UpdateOrigin) -> Self {
        Self { broker, origin }
    }

    #[must_use]
    pub fn origin(&self) -> &UpdateOrigin {
        &self.origin
    }

    /// Publishes `headers` with already-abstract value lists. Returns the
    /// number of notifications delivered.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` (UNKNOWN) when the header and value
    /// counts differ, or `EngineError::Body` when the value lists are malformed.
    pub async fn publish(&self, headers: &[UpdateHeader], values: Vec<AbstractElement>) -> EngineResult<usize> {
        let mut handler = self.broker.new_value_handler();
        handler.init_update_value_list(values)?;
        check_lengths(headers, &*handler)?;
        let notifications = self.broker.fan_out(&self.origin, headers, &mut *handler)?;
        Ok(self.broker.deliver(notifications).await)
    }

    /// Publishes `headers` with one value list of `T`.
    ///
    /// # Errors
    ///
    /// As [`Self::publish`].
    pub async fn publish_list<T: Element>(&self, headers: &[UpdateHeader], values: Vec<T>) -> EngineResult<usize> {
        let element = AbstractElement::from_element(&values)?;
        self.publish(headers, vec![element]).await
    }
}
