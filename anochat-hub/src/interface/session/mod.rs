pub mod bot;
pub mod socket;

pub use bot::{BotSession, BotTransport};
pub use socket::{FrameTransport, SocketSession};
