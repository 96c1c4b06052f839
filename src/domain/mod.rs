pub mod deferred;
pub mod entities;
pub mod errors;
pub mod events;
pub mod hot_stream;
pub mod pipeline;
pub mod repositories;
pub mod services;
pub mod signal;
pub mod subscription;
pub mod value_objects;

pub use deferred::*;
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use hot_stream::*;
pub use pipeline::*;
pub use repositories::*;
pub use services::*;
pub use signal::*;
pub use subscription::*;
pub use value_objects::*;
