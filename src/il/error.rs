//! Defines error types and codes.

use thiserror::Error;

use super::state::IlState;
use super::PortIndex;

/// An error raised by a component, a port protocol, or the graph layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IlError {
    /// An allocation failed, or a dependency was missing.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
    /// The operation is not legal in the component's or port's current
    /// state.
    #[error("operation not legal: {0}")]
    IncorrectStateOperation(String),
    /// The requested state is not adjacent to the current one.
    #[error("illegal state transition: {0:?} -> {1:?}")]
    IncorrectStateTransition(IlState, IlState),
    /// A parameter struct was mis-sized, out of range, or referenced a
    /// nonexistent port.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// A transition to Idle required buffers that never arrived.
    #[error("port {0} never became populated")]
    PortUnpopulated(PortIndex),
    /// The stream could not be decoded or probed.
    #[error("stream corrupt: {0}")]
    StreamCorrupt(String),
    /// The tunnel peer vanished or rejected a buffer.
    #[error("port {0}: tunnel peer failed")]
    PortError(PortIndex),
    /// No component implements the requested role.
    #[error("no component found: {0}")]
    ComponentNotFound(String),
    /// A transition guard never became true.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// The component is not ready; retry when the next buffer arrives.
    ///
    /// This is the only retriable kind: it parks the servant's mailbox
    /// without advancing and is never surfaced as an `Error` event.
    #[error("not ready")]
    NotReady,
    /// The playlist iterator is exhausted. A terminal event, not a failure.
    #[error("end of playlist")]
    EndOfList,
    /// The component's worker is gone, usually because the component was
    /// destroyed.
    #[error("component disconnected")]
    Disconnected,
}

/// A stable numeric code for each error kind, suitable for carrying in
/// events and comparing across threads.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Allocation failure or missing dependency.
    InsufficientResources = 0x8000_1000,
    /// Unspecified failure.
    Undefined = 0x8000_1001,
    /// No component implements the requested role.
    ComponentNotFound = 0x8000_1003,
    /// Invalid or out-of-range parameter.
    BadParameter = 0x8000_1005,
    /// Codec could not decode, or probe failed.
    StreamCorrupt = 0x8000_100A,
    /// Retriable; the caller should try again on the next buffer.
    NotReady = 0x8000_1010,
    /// A guard never became true.
    Timeout = 0x8000_1011,
    /// Command not legal as a transition from the current state.
    IncorrectStateTransition = 0x8000_1017,
    /// Command not legal as an operation in the current state.
    IncorrectStateOperation = 0x8000_1018,
    /// Transition to Idle required buffers that never arrived.
    PortUnpopulated = 0x8000_1019,
    /// Tunnel peer vanished or rejected a buffer.
    PortError = 0x8000_101B,
    /// Playlist exhausted. Terminal, not a failure.
    EndOfList = 0x8000_7001,
    /// Component worker is gone.
    Disconnected = 0x8000_7002,
}

// `enum_primitive_derive::Primitive` generates its `from_i64`/`from_u64`
// match arms from the raw discriminant literals with no explicit type
// ascription, which defaults them to `i32` and fails to compile for
// discriminants above `i32::MAX` (all of these, being OMX-style
// `0x8000_xxxx` codes). Implemented by hand here with explicit `u32`
// casts to sidestep that.
impl num_traits::FromPrimitive for ErrorCode {
    fn from_u64(val: u64) -> Option<Self> {
        match val as u32 {
            x if x == ErrorCode::InsufficientResources as u32 => {
                Some(ErrorCode::InsufficientResources)
            }
            x if x == ErrorCode::Undefined as u32 => Some(ErrorCode::Undefined),
            x if x == ErrorCode::ComponentNotFound as u32 => Some(ErrorCode::ComponentNotFound),
            x if x == ErrorCode::BadParameter as u32 => Some(ErrorCode::BadParameter),
            x if x == ErrorCode::StreamCorrupt as u32 => Some(ErrorCode::StreamCorrupt),
            x if x == ErrorCode::NotReady as u32 => Some(ErrorCode::NotReady),
            x if x == ErrorCode::Timeout as u32 => Some(ErrorCode::Timeout),
            x if x == ErrorCode::IncorrectStateTransition as u32 => {
                Some(ErrorCode::IncorrectStateTransition)
            }
            x if x == ErrorCode::IncorrectStateOperation as u32 => {
                Some(ErrorCode::IncorrectStateOperation)
            }
            x if x == ErrorCode::PortUnpopulated as u32 => Some(ErrorCode::PortUnpopulated),
            x if x == ErrorCode::PortError as u32 => Some(ErrorCode::PortError),
            x if x == ErrorCode::EndOfList as u32 => Some(ErrorCode::EndOfList),
            x if x == ErrorCode::Disconnected as u32 => Some(ErrorCode::Disconnected),
            _ => None,
        }
    }

    fn from_i64(val: i64) -> Option<Self> {
        if val < 0 {
            return None;
        }
        Self::from_u64(val as u64)
    }
}

impl num_traits::ToPrimitive for ErrorCode {
    fn to_u64(&self) -> Option<u64> {
        Some(*self as u32 as u64)
    }

    fn to_i64(&self) -> Option<i64> {
        Some(*self as u32 as i64)
    }
}

impl IlError {
    /// The stable numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            IlError::InsufficientResources(_) => ErrorCode::InsufficientResources,
            IlError::IncorrectStateOperation(_) => ErrorCode::IncorrectStateOperation,
            IlError::IncorrectStateTransition(_, _) => ErrorCode::IncorrectStateTransition,
            IlError::BadParameter(_) => ErrorCode::BadParameter,
            IlError::PortUnpopulated(_) => ErrorCode::PortUnpopulated,
            IlError::StreamCorrupt(_) => ErrorCode::StreamCorrupt,
            IlError::PortError(_) => ErrorCode::PortError,
            IlError::ComponentNotFound(_) => ErrorCode::ComponentNotFound,
            IlError::Timeout(_) => ErrorCode::Timeout,
            IlError::NotReady => ErrorCode::NotReady,
            IlError::EndOfList => ErrorCode::EndOfList,
            IlError::Disconnected => ErrorCode::Disconnected,
        }
    }

    /// Whether the error is transient and should be retried on mailbox
    /// re-entry rather than surfaced.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IlError::NotReady)
    }

    /// Whether this is a terminal-but-expected condition rather than a
    /// failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IlError::EndOfList)
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            IlError::InsufficientResources("x".into()).code() as u32,
            0x8000_1000
        );
        assert_eq!(
            IlError::IncorrectStateTransition(IlState::Loaded, IlState::Executing).code() as u32,
            0x8000_1017
        );
        assert_eq!(
            ErrorCode::from_u32(0x8000_1019),
            Some(ErrorCode::PortUnpopulated)
        );
    }

    #[test]
    fn only_not_ready_is_retriable() {
        assert!(IlError::NotReady.is_retriable());
        assert!(!IlError::EndOfList.is_retriable());
        assert!(!IlError::BadParameter("p".into()).is_retriable());
        assert!(IlError::EndOfList.is_terminal());
    }
}
