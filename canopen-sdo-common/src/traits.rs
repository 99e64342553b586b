//! Transport traits consumed by the SDO client
use crate::messages::CanMessage;

/// An async CAN sender trait
pub trait AsyncCanSender: Send {
    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), CanMessage>>;
}

/// An async CAN receiver trait
///
/// Implementations are expected to only ever yield frames already filtered to the SDO client's
/// response COB-ID; the client performs no dispatch of its own beyond the final `id` check in
/// [`crate::sdo::SdoResponse`] decoding.
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: core::fmt::Debug + Send;

    /// Receive available message immediately
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    ///
    /// Used at the start of a transfer to discard stale frames left over from a prior, timed-out
    /// transaction before they can be mistaken for a reply to the new request.
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
