//! Utility functions for nodemesh

/// Number of worker permits when the config does not pin one.
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Generate a request id correlating one distributed operation.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validate a datastore or collection name
pub fn validate_name(kind: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::operation(
            crate::ErrorCode::InvalidArgument,
            format!("{} name cannot be empty", kind),
        ));
    }

    if name.len() > 255 || name.chars().any(|c| c.is_control() || c == '\n') {
        return Err(crate::Error::operation(
            crate::ErrorCode::InvalidArgument,
            format!("invalid {} name: {:?}", kind, name),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("datastore", "sales").is_ok());
        assert!(validate_name("datastore", "").is_err());
        assert!(validate_name("collection", "a\nb").is_err());
        assert!(validate_name("collection", &"x".repeat(300)).is_err());
    }

    #[test]
    fn test_available_workers() {
        assert!(available_workers() >= 1);
    }
}
