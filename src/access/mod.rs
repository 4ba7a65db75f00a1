/*!
 * Access Module
 * Balanced, time-bounded access grants over capability tokens
 */

pub mod broker;
pub mod grant;
pub mod scope;

pub use broker::AccessBroker;
pub use grant::{ActiveGrant, GrantInfo};
pub use scope::AccessScope;
