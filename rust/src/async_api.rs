//! Async convenience API built on top of sync generators.

use uuid::Uuid;

use crate::{IdError, TimeBasedAlphanumericGen, TimeUuidGen};

/// Get one alphanumeric id in async contexts.
pub async fn async_next_alphanumeric(postfix_digits: usize) -> Result<String, IdError> {
    let generator = TimeBasedAlphanumericGen::new(postfix_digits)?;
    generator.next_id()
}

/// Generate a finite batch of alphanumeric ids from one generator.
pub async fn async_alphanumeric_stream(
    count: usize,
    postfix_digits: usize,
) -> Result<Vec<String>, IdError> {
    let generator = TimeBasedAlphanumericGen::new(postfix_digits)?;
    generator.next_n(count)
}

/// Get one time-based UUID from a shared generator in async contexts.
pub async fn async_next_time_uuid(generator: &TimeUuidGen) -> Result<Uuid, IdError> {
    generator.next_uuid()
}
