pub mod frame;
pub mod pool;
pub mod replacer;

pub use frame::{Frame, FrameId};
pub use pool::BufferPool;
pub use replacer::{ClockReplacer, LruReplacer, Replacer};
