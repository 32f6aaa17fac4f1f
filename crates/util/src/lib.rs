//! Test tooling shared across the workspace.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Ephemeral port allocation for tests that run many servers side by side.
pub mod port_allocator;
