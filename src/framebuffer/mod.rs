pub mod ring;

pub use ring::{DmaAddr, FrameBufferPool, HeadMode, PoolStats, SlotMeta, TailMode};
