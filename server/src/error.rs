//! Client-facing protocol errors.
//!
//! Every variant surfaces to the offending client as an `E` message whose
//! body is the display text, immediately followed by a close. Lagged frames
//! and commands are not errors at all; they are silently discarded upstream
//! of this type.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("malformed message")]
    Malformed,
    #[error("message too large")]
    MessageTooLarge,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("frame out of order")]
    FrameOutOfOrder,
    #[error("frame too far ahead")]
    FrameTooFast,
    #[error("command serial out of order")]
    SerialOutOfOrder,
    #[error("unknown command")]
    UnknownVerb,
    #[error("command rate exceeded")]
    CommandRateExceeded,
    #[error("argument too long")]
    ArgTooLong,
    #[error("input too long")]
    InputTooLong,
    #[error("bad username or password")]
    BadCredentials,
    #[error("no such instance")]
    UnknownInstance,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("chat rate exceeded")]
    ChatRateExceeded,
    #[error("chat message too long")]
    ChatTooLong,
    #[error("not authorized")]
    NotAuthorized,
    #[error("invalid username")]
    InvalidUsername,
    #[error("invalid password")]
    InvalidPassword,
    #[error("username taken")]
    UsernameTaken,
    #[error("config too large")]
    ConfigTooLarge,
    #[error("self-serve registration disabled")]
    SelfServeDisabled,
    #[error("timed out")]
    TimedOut,
    #[error("bad origin")]
    BadOrigin,
    #[error("internal error")]
    Internal,
}
