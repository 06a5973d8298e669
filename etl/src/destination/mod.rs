pub mod base;
pub mod memory;
pub mod redshift;

pub use base::Destination;
