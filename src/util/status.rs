use core::fmt;

use log::error;

/// Channel operation error status
#[derive(Clone, PartialEq, Eq)]
pub struct Status {
    /// The error kind
    code: Code,
    /// A relevant error message
    message: String,
}

/// Channel operation error kind.
///
/// No error is retried inside the core; the host decides the reaction
/// (retry after a peer message, drop the message, or force-close).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    /// The required elkrem index has not been revealed yet
    ElkUnknown,
    /// The elkrem receiver rejected a revealed hash
    ElkInconsistent,
    /// Signature verification failed
    BadSig,
    /// A signature or key failed to parse
    Decode,
    /// An in-flight delta was not flushed before building a commitment
    InflightNotFlushed,
    /// A protocol step arrived out of order
    StateOrderViolation,
    /// The peer revealed an elkrem inconsistent with its earlier commitment
    ChannelBroken,
    /// A reconstructed script does not match the on-chain script
    ScriptMismatch,
    /// A spend of the funding outpoint has an unrecognized shape
    MalformedClose,
    /// The transaction does not spend this channel
    NotMyChannel,
    /// Client specified an invalid argument
    InvalidArgument,
    /// An internal invariant was violated; caller bug
    InternalInvariant,
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status { code, message: message.into() }
    }

    /// Get the `Code` of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");
        builder.field("code", &self.code);
        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }
        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, message: {:?}", self.code(), self.message())
    }
}

impl std::error::Error for Status {}

/// The required elkrem index has not been revealed yet
pub fn elk_unknown(msg: impl Into<String>) -> Status {
    Status::new(Code::ElkUnknown, msg)
}

/// The elkrem receiver rejected a revealed hash
pub fn elk_inconsistent(msg: impl Into<String>) -> Status {
    Status::new(Code::ElkInconsistent, msg)
}

/// Signature verification failed
pub fn bad_sig(msg: impl Into<String>) -> Status {
    Status::new(Code::BadSig, msg)
}

/// A signature or key failed to parse
pub fn decode_error(msg: impl Into<String>) -> Status {
    Status::new(Code::Decode, msg)
}

/// An in-flight delta was not flushed
pub fn inflight_not_flushed(msg: impl Into<String>) -> Status {
    Status::new(Code::InflightNotFlushed, msg)
}

/// A protocol step arrived out of order
pub fn state_order_violation(msg: impl Into<String>) -> Status {
    Status::new(Code::StateOrderViolation, msg)
}

/// The channel is not recoverable and must be force-closed
pub fn channel_broken(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("CHANNEL BROKEN: {}", &s);
    Status::new(Code::ChannelBroken, s)
}

/// A reconstructed script does not match the on-chain script
pub fn script_mismatch(msg: impl Into<String>) -> Status {
    Status::new(Code::ScriptMismatch, msg)
}

/// A spend of the funding outpoint has an unrecognized shape
pub fn malformed_close(msg: impl Into<String>) -> Status {
    Status::new(Code::MalformedClose, msg)
}

/// The transaction does not spend this channel
pub fn not_my_channel(msg: impl Into<String>) -> Status {
    Status::new(Code::NotMyChannel, msg)
}

/// An invalid argument was detected
pub fn invalid_argument(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("INVALID ARGUMENT: {}", &s);
    Status::new(Code::InvalidArgument, s)
}

/// An internal invariant was violated
pub fn internal_invariant(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("INTERNAL INVARIANT: {}", &s);
    Status::new(Code::InternalInvariant, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_test() {
        let s = bad_sig("testing");
        assert_eq!(s.code(), Code::BadSig);
        assert_eq!(s.message(), "testing");
        assert_eq!(format!("{}", s), "status: BadSig, message: \"testing\"");
        assert_eq!(format!("{:?}", elk_unknown("")), "Status { code: ElkUnknown }");
    }
}
