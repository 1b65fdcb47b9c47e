//! Types shared by the dispatcher, the value store and the republisher.

mod contact;
mod kuid;
pub mod messages;
mod routing_table;
mod value;

pub use contact::*;
pub use kuid::*;
pub use messages::*;
pub use routing_table::*;
pub use value::*;
