pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod instance;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TaskweaveError};
pub use event::{EngineEvent, EventBus};
pub use graph::Graph;
pub use instance::*;
pub use template::*;
pub use traits::{GraphStore, NewChild};
pub use types::*;
