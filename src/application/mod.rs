pub mod bridge;
pub mod consumer;
pub mod options;
pub mod producer;

pub use bridge::*;
pub use consumer::*;
pub use options::*;
pub use producer::*;
