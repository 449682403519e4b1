//! Publish-subscribe data types and the per-component matching rules.
//!
//! - [`EntityKey`] is both the key of an update and a pattern in a
//!   subscription. A pattern component set to the wildcard (`"*"` for the
//!   first sub-key, `0` for the numeric ones) matches anything, including an
//!   absent component. An absent (or empty) pattern component only matches an
//!   absent component. Anything else requires equality.
//! - [`domain_matches`] implements the domain rule: the subscription domain,
//!   extended by the request sub-domain, must equal the update domain, unless
//!   the sub-domain ends with `"*"`, in which case the update domain may carry
//!   extra trailing components.

use serde::{Deserialize, Serialize};

use crate::body::{short_form, Element, MAL_AREA, MAL_AREA_VERSION};
use crate::types::{Identifier, Uri};

/// A four-part entity key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub first_sub_key: Option<Identifier>,
    pub second_sub_key: Option<i64>,
    pub third_sub_key: Option<i64>,
    pub fourth_sub_key: Option<i64>,
}

impl EntityKey {
    /// A key with all four components present.
    #[must_use]
    pub fn new(first: &str, second: i64, third: i64, fourth: i64) -> Self {
        Self {
            first_sub_key: Some(Identifier::from(first)),
            second_sub_key: Some(second),
            third_sub_key: Some(third),
            fourth_sub_key: Some(fourth),
        }
    }

    /// The pattern matching every key: `("*", 0, 0, 0)`.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::new("*", 0, 0, 0)
    }

    /// Tests `key` against `self` used as a pattern.
    #[must_use]
    pub fn matches(&self, key: &EntityKey) -> bool {
        first_key_matches(self.first_sub_key.as_ref(), key.first_sub_key.as_ref())
            && numeric_key_matches(self.second_sub_key, key.second_sub_key)
            && numeric_key_matches(self.third_sub_key, key.third_sub_key)
            && numeric_key_matches(self.fourth_sub_key, key.fourth_sub_key)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn part<T: std::fmt::Display>(v: Option<&T>) -> String {
            v.map_or_else(|| "null".to_string(), ToString::to_string)
        }
        write!(
            f,
            "[{}.{}.{}.{}]",
            part(self.first_sub_key.as_ref()),
            part(self.second_sub_key.as_ref()),
            part(self.third_sub_key.as_ref()),
            part(self.fourth_sub_key.as_ref())
        )
    }
}

fn first_key_matches(pattern: Option<&Identifier>, value: Option<&Identifier>) -> bool {
    let pattern = pattern.filter(|p| !p.as_str().is_empty());
    let value = value.filter(|v| !v.as_str().is_empty());
    match (pattern, value) {
        (Some(p), _) if p.is_wildcard() => true,
        (Some(p), Some(v)) => p == v,
        (None, None) => true,
        _ => false,
    }
}

fn numeric_key_matches(pattern: Option<i64>, value: Option<i64>) -> bool {
    match (pattern, value) {
        (Some(0), _) | (None, None) => true,
        (Some(p), Some(v)) => p == v,
        _ => false,
    }
}

/// Tests an update domain against a subscription domain plus optional
/// request sub-domain.
#[must_use]
pub fn domain_matches(
    subscription_domain: &[Identifier],
    sub_domain: Option<&[Identifier]>,
    update_domain: &[Identifier],
) -> bool {
    let sub_domain = sub_domain.unwrap_or(&[]);
    let (sub_domain, allow_extra) = match sub_domain.split_last() {
        Some((last, rest)) if last.is_wildcard() => (rest, true),
        _ => (sub_domain, false),
    };

    let required = subscription_domain.len() + sub_domain.len();
    let length_ok = if allow_extra {
        update_domain.len() >= required
    } else {
        update_domain.len() == required
    };

    length_ok
        && subscription_domain
            .iter()
            .chain(sub_domain)
            .zip(update_domain)
            .all(|(required, actual)| required == actual)
}

/// One filter inside a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRequest {
    pub sub_domain: Option<Vec<Identifier>>,
    pub all_areas: bool,
    pub all_services: bool,
    pub all_operations: bool,
    pub only_on_change: bool,
    pub entity_keys: Vec<EntityKey>,
}

/// The body of a REGISTER message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Identifier,
    pub entities: Vec<EntityRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    /// The entity appeared.
    #[default]
    Creation,
    /// New value, same definition.
    Update,
    /// The entity's definition changed.
    Modification,
    /// The entity is gone.
    Deletion,
}

/// Header describing one update of a publish or notify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHeader {
    pub timestamp: u64,
    pub source_uri: Uri,
    pub update_type: UpdateType,
    pub key: EntityKey,
}

impl UpdateHeader {
    #[must_use]
    pub fn new(key: EntityKey, update_type: UpdateType) -> Self {
        Self {
            key,
            update_type,
            ..Self::default()
        }
    }
}

const fn mal_structure(type_number: i32) -> i64 {
    short_form(MAL_AREA, 0, MAL_AREA_VERSION, type_number)
}

impl Element for Subscription {
    const SHORT_FORM: i64 = mal_structure(23);
}

impl Element for EntityRequest {
    const SHORT_FORM: i64 = mal_structure(24);
}

impl Element for EntityKey {
    const SHORT_FORM: i64 = mal_structure(25);
}

impl Element for UpdateHeader {
    const SHORT_FORM: i64 = mal_structure(26);
}
