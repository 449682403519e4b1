//! Subscription matching.
//!
//! An update matches a subscription when the session agrees and at least
//! one entity request accepts it. An entity request accepts an update when
//! the domain matches, each of area, service and operation is either
//! wildcarded by its `all_*` flag or equal to the subscription's, and at
//! least one of its entity key patterns matches the update key.

use mal_core::{
    domain_matches, EntityKey, EntityRequest, Identifier, Message, OperationKey, SessionType,
};

/// Routing context of a publish: who it claims to come from and for which
/// operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOrigin {
    pub domain: Vec<Identifier>,
    pub session: SessionType,
    pub session_name: Identifier,
    pub operation: OperationKey,
}

impl UpdateOrigin {
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            domain: message.header.domain.clone(),
            session: message.header.session,
            session_name: message.header.session_name.clone(),
            operation: message.operation,
        }
    }
}

/// What a subscription selects, captured from its REGISTER message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriptionFilter {
    pub domain: Vec<Identifier>,
    pub session: SessionType,
    pub session_name: Identifier,
    pub operation: OperationKey,
    pub entities: Vec<EntityRequest>,
}

impl SubscriptionFilter {
    pub(crate) fn new(origin: UpdateOrigin, entities: Vec<EntityRequest>) -> Self {
        Self {
            domain: origin.domain,
            session: origin.session,
            session_name: origin.session_name,
            operation: origin.operation,
            entities,
        }
    }

    pub(crate) fn matches(&self, origin: &UpdateOrigin, key: &EntityKey) -> bool {
        self.session == origin.session
            && self.session_name == origin.session_name
            && self
                .entities
                .iter()
                .any(|request| self.request_matches(request, origin, key))
    }

    fn request_matches(&self, request: &EntityRequest, origin: &UpdateOrigin, key: &EntityKey) -> bool {
        domain_matches(&self.domain, request.sub_domain.as_deref(), &origin.domain)
            && (request.all_areas || self.operation.area == origin.operation.area)
            && (request.all_services || self.operation.service == origin.operation.service)
            && (request.all_operations || self.operation.operation == origin.operation.operation)
            && request.entity_keys.iter().any(|pattern| pattern.matches(key))
    }
}
