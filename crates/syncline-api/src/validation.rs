use crate::selector::{DestinationSelector, SelectorError};
use crate::types::MetaData;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("invalid destination selector: {0}")]
    Selector(&'static str),
    #[error("invalid value for {0}")]
    Invalid(&'static str),
}

/// Validates object metadata on create/update.
pub fn validate_meta(meta: &MetaData) -> Result<(), ValidationError> {
    if meta.org_id.trim().is_empty() {
        return Err(ValidationError::Empty("org_id"));
    }
    if meta.object_type.trim().is_empty() {
        return Err(ValidationError::Empty("object_type"));
    }
    if meta.object_id.trim().is_empty() {
        return Err(ValidationError::Empty("object_id"));
    }
    match DestinationSelector::from_meta(meta) {
        Ok(_) => {}
        Err(SelectorError::IdWithoutType) => {
            return Err(ValidationError::Selector("dest_id without dest_type"))
        }
        Err(SelectorError::Conflicting) => {
            return Err(ValidationError::Selector(
                "more than one destination selector",
            ))
        }
    }
    for entry in meta.destinations_list.iter() {
        let mut parts = entry.splitn(2, ':');
        let dest_type = parts.next().unwrap_or("");
        let dest_id = parts.next().unwrap_or("");
        if dest_type.is_empty() || dest_id.is_empty() {
            return Err(ValidationError::Invalid("destinations_list"));
        }
    }
    if meta.expected_consumers < 1 {
        return Err(ValidationError::Invalid("expected_consumers"));
    }
    if meta.no_data && meta.object_size != 0 {
        return Err(ValidationError::Invalid("object_size"));
    }
    if meta.object_size < 0 {
        return Err(ValidationError::Invalid("object_size"));
    }
    if meta.chunk_size < 0 {
        return Err(ValidationError::Invalid("chunk_size"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key_parts() {
        let meta = MetaData::new("", "t", "i");
        assert_eq!(validate_meta(&meta), Err(ValidationError::Empty("org_id")));
        let meta = MetaData::new("o", " ", "i");
        assert_eq!(
            validate_meta(&meta),
            Err(ValidationError::Empty("object_type"))
        );
    }

    #[test]
    fn rejects_bad_destination_list_entries() {
        let mut meta = MetaData::new("o", "t", "i");
        meta.destinations_list = vec!["edge".to_string()];
        assert_eq!(
            validate_meta(&meta),
            Err(ValidationError::Invalid("destinations_list"))
        );
        meta.destinations_list = vec!["edge:node1".to_string()];
        assert!(validate_meta(&meta).is_ok());
    }

    #[test]
    fn rejects_no_data_with_size() {
        let mut meta = MetaData::new("o", "t", "i");
        meta.no_data = true;
        meta.object_size = 10;
        assert_eq!(
            validate_meta(&meta),
            Err(ValidationError::Invalid("object_size"))
        );
    }

    #[test]
    fn rejects_zero_consumers() {
        let mut meta = MetaData::new("o", "t", "i");
        meta.expected_consumers = 0;
        assert_eq!(
            validate_meta(&meta),
            Err(ValidationError::Invalid("expected_consumers"))
        );
    }
}
