//! Cross-cutting filters: error propagation, deadlines, h2c upgrades.

mod error;
mod h2c;
mod timeout;

pub use error::{ErrorFilter, TERROR_HEADER};
pub use h2c::H2cFilter;
pub use timeout::{ExpirationFilter, TimeoutFilter, TIMEOUT_HEADER};
