/*!
 * Service Module
 * Privileged side of the channel: session checks, command runner, server
 */

pub mod runner;
pub mod server;
pub mod session;

pub use runner::{classify, CommandRunner};
pub use server::ExecutionService;
pub use session::{ServiceSession, SessionValidator};
