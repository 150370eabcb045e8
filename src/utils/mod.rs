//! The `utils` module collects the pieces shared by every other module:
//! the error enums, the opaque identifier newtypes and logging setup.

pub mod error;
pub mod ids;
pub mod logging;

#[cfg(test)]
mod tests;
