//! Local process communication: synchronous rendezvous messaging between
//! threads.
//!
//! Every thread embeds a [`MessageQueue`]; its tid is its endpoint. A send
//! completes only after the receiver has copied the body out, so at most one
//! message per sender is ever in flight.

pub mod channel;
pub mod message;
pub mod queue;

pub use channel::MsgBuf;
pub use message::{MessageBody, RawMessage, MSG_PAYLOAD, MSG_SIZE};
pub use queue::{Message, MessageQueue};

use crate::thread::Tid;

/// Messaging address of a thread.
pub type Endpoint = Tid;

/// Source filter that accepts a message from any sender.
pub const LPC_RECV_ANY: Endpoint = 0;
