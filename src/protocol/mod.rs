/*!
 * Channel Protocol
 *
 * Request = (command, args, env, working directory, capability tokens,
 * timeout); reply = (exit code, stdout, stderr) or a typed error.
 */

pub mod codec;
pub mod types;

pub use codec::{encode_frame, read_frame, write_frame};
pub use types::{ClientFrame, CommandEnvelope, ServiceFrame, PROTOCOL_VERSION};
