use crate::types::{DestinationPolicy, MetaData};

/// The one routing rule an object carries. Derived from the four metadata
/// routing fields, of which exactly one kind may be set.
#[derive(Clone, Debug, PartialEq)]
pub enum DestinationSelector {
    /// A single destination (dest_type, dest_id).
    Single(String, String),
    /// An explicit list of "type:id" pairs.
    List(Vec<String>),
    /// Every destination of the given type; an empty type means the whole
    /// organization.
    Broadcast(String),
    /// Deferred to the external policy engine.
    Policy(DestinationPolicy),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorError {
    /// dest_id set without dest_type.
    IdWithoutType,
    /// More than one routing kind set at once.
    Conflicting,
}

impl DestinationSelector {
    pub fn from_meta(meta: &MetaData) -> Result<Self, SelectorError> {
        let has_single = !meta.dest_id.is_empty();
        let has_list = !meta.destinations_list.is_empty();
        let has_policy = meta.destination_policy.is_some();

        if has_single && meta.dest_type.is_empty() {
            return Err(SelectorError::IdWithoutType);
        }
        let kinds = [has_single, has_list, has_policy]
            .iter()
            .filter(|set| **set)
            .count();
        if kinds > 1 {
            return Err(SelectorError::Conflicting);
        }

        if let Some(policy) = meta.destination_policy.as_ref() {
            return Ok(DestinationSelector::Policy(policy.clone()));
        }
        if has_single {
            return Ok(DestinationSelector::Single(
                meta.dest_type.clone(),
                meta.dest_id.clone(),
            ));
        }
        if has_list {
            return Ok(DestinationSelector::List(meta.destinations_list.clone()));
        }
        Ok(DestinationSelector::Broadcast(meta.dest_type.clone()))
    }
}
