pub mod classifier;
pub mod score;

pub use classifier::classify;
pub use score::normalize;
