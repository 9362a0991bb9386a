//! DNS wire format: just enough parsing to classify a message and to
//! synthesize a SERVFAIL reply. Answer data is never decoded; it is carried
//! verbatim in [`message::Message::raw`] and forwarded unchanged.

pub mod common;
pub mod enums;
pub mod header;
pub mod message;
pub mod question;

pub use enums::{Opcode, QType, ResponseCode};
pub use header::Header;
pub use message::Message;
pub use question::Question;
