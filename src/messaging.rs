//! Chat platform adapter and reply plumbing.

pub mod chunking;
pub mod discord;
pub mod traits;

pub use traits::ChannelHandle;
