use std::net::SocketAddr;
use std::num::ParseIntError;
use std::time::SystemTimeError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the stack (or one of its connectors/check lists) is closed.
    #[error("the ICE stack is closed")]
    ErrClosed,

    /// Indicates a check list has no usable candidate pairs.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// Indicates connectivity checking was canceled by the caller.
    #[error("connecting canceled by caller")]
    ErrCanceledByCaller,

    /// Indicates a stack/check list was started twice.
    #[error("attempted to start twice")]
    ErrMultipleStart,

    /// Indicates a remote ufrag was empty where one was required.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates a remote password was empty where one was required.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates a TURN/STUN URL had an empty username.
    #[error("username is empty")]
    ErrUsernameEmpty,

    /// Indicates a TURN/STUN URL had an empty password.
    #[error("password is empty")]
    ErrPasswordEmpty,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    /// Indicates that one or more non-host candidates were selected for a lite agent.
    #[error("lite agents must only use host candidates")]
    ErrLiteUsingNonHostCandidates,

    /// Indicates a run operation was canceled by its individual done signal.
    #[error("run was canceled by done")]
    ErrRunCanceled,

    /// Indicates we already have a connector with the same (local, remote) pair.
    #[error("conn with same remote addr already exists")]
    ErrTcpRemoteAddrAlreadyExists,

    #[error("failed to send packet")]
    ErrSendPacket,
    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse component")]
    ErrParseComponent,
    #[error("could not parse priority")]
    ErrParsePriority,
    #[error("could not parse port")]
    ErrParsePort,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("connection with same remote address already exists")]
    ErrConnectionAddrAlreadyExist,
    #[error("error reading streaming packet")]
    ErrReadingStreamingPacket,
    #[error("error writing to")]
    ErrWriting,
    #[error("error closing connection")]
    ErrClosingConnection,
    #[error("unable to determine networkType")]
    ErrDetermineNetworkType,
    #[error("unexpected error trying to read")]
    ErrRead,
    #[error("unknown role")]
    ErrUnknownRole,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("Candidate IP could not be found")]
    ErrCandidateIpNotFound,

    /// No Connector is registered for the given (local, remote) pair.
    #[error("no route to {remote:?} via {local}")]
    NoRoute {
        local: SocketAddr,
        remote: Option<SocketAddr>,
    },

    /// A `Response` arrived whose transaction ID does not match any outstanding
    /// client transaction.
    #[error("transaction does not exist")]
    TransactionDoesNotExist,

    /// `StunServerTransaction::send_response` was called a second time for the
    /// same transaction.
    #[error("transaction has already been answered")]
    TransactionAlreadyAnswered,

    /// The remote peer claims the same controlling/controlled role as this agent
    /// and lost the tie-break; surfaced to callers that inspect the conflict
    /// outcome rather than only observing the 487 sent over the wire.
    #[error("role conflict")]
    RoleConflict,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}
