//! Wire-level types for the CANopen SDO (Service Data Object) protocol.
//!
//! This crate has no opinion on how frames reach the bus; it only defines the
//! message shapes ([`messages::CanMessage`]) and the SDO command vocabulary
//! ([`sdo::SdoRequest`], [`sdo::SdoResponse`]) that `canopen-sdo-client` drives.

pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
