//! An async client for the CANopen SDO (Service Data Object) protocol.
//!
//! The crate provides [`SdoClient`], which drives expedited, segmented, and block SDO transfers
//! against a single server node, over any transport implementing
//! [`canopen_sdo_common::traits::AsyncCanSender`] and
//! [`canopen_sdo_common::traits::AsyncCanReceiver`].
//!
//! This library is built on tokio/async. It has no knowledge of the Object Dictionary beyond the
//! index/sub-index pair identifying the object under transfer, and does not implement NMT, LSS,
//! or PDO configuration.
#![warn(missing_docs, missing_debug_implementations)]

mod sdo_client;

pub use canopen_sdo_common as common;

pub use sdo_client::{
    OpenMode, RawAbortCode, SdoClient, SdoClientError, SdoReader, SdoStream, SdoWriter,
};
