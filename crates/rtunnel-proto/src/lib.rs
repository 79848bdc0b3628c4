//! Control protocol definitions
//!
//! Message types exchanged between the tunnel client and the relay server,
//! plus the length-prefixed frame codec used on control and work connections.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MessageCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
