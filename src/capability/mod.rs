/*!
 * Capability Module
 * Capability tokens, platform primitives and their persistent store
 */

pub mod platform;
pub mod store;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use platform::PathCapabilityPlatform;
pub use store::CapabilityStore;
pub use traits::*;
pub use types::*;
