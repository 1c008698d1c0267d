// Library modules
pub mod broker;
pub mod bus;
pub mod config;
pub mod constants;
pub mod controller;
pub mod model;
pub mod store;
pub mod wire;

// Re-export commonly used types
pub use broker::{Broker, LoopEvent};
pub use bus::{BusEvent, BusSender, Message, Outbound, Rid};
pub use config::Config;
pub use controller::dns::{SystemResolver, TokenLookup};
pub use model::Model;
pub use store::Store;
pub use wire::{WireMap, WireValue};
