pub mod destination;
pub mod error;
pub mod macros;
pub mod pipeline;
pub mod segment;
pub mod shutdown;
pub mod source;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod upload;
