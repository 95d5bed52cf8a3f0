pub mod cache;
pub mod compose;
pub mod detection;
pub mod identity;
pub mod pipeline;
pub mod preview;
pub mod sampler;
pub mod scoring;
pub mod selector;
pub mod video;
