pub mod latch;

pub use self::latch::ResettableLatch;
