pub mod manager;

pub use manager::{OverallStatus, WsHandlers, WsManager, WsManagerConfig};
