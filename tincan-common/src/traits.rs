//! The boundary to the CAN transport

use crate::messages::CanMessage;

/// A frame the transport could not accept, handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub struct CanSendError(pub CanMessage);

impl core::fmt::Display for CanSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CAN transport rejected frame {:?}", self.0)
    }
}

impl core::error::Error for CanSendError {}

/// A synchronous CAN sender
///
/// The node hands every frame it produces during a `step` call to the sender.
pub trait CanSender {
    /// Put `msg` on the bus, or return it if the transport is full
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError>;
}

impl<T: CanSender + ?Sized> CanSender for &mut T {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        (**self).send(msg)
    }
}
