// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error taxonomy for the core. Every operation that can fail returns [`Fail`]
//! rather than a raw `io::Error`, so that deadline/EOF/close semantics are
//! distinguishable from a verbatim transport error at the call site.

use custom_error::custom_error;
use std::io;

custom_error! {
    /// Errors produced by the asynchronous-call machinery.
    #[derive(PartialEq)]
    pub Fail
    Invalid = "the file descriptor is closed or broken (EINVAL)",
    DeadlineExceeded = "i/o deadline exceeded",
    Eof = "end of stream",
    UnexpectedEof = "unexpected end of stream on write",
    Transport{source: IoErrorEq} = "transport error: {source}",
    Notifier{source: IoErrorEq} = "event notifier error: {source}",
    AddressParse{details: String} = "failed to parse address: {details}",
    UnsupportedNetwork{details: String} = "unsupported network: {details}",
}

impl Fail {
    /// Wraps a raw transport-level [`io::Error`].
    pub fn transport(e: io::Error) -> Self {
        Fail::Transport { source: IoErrorEq(e) }
    }

    /// Wraps a raw notifier-registration [`io::Error`].
    pub fn notifier(e: io::Error) -> Self {
        Fail::Notifier { source: IoErrorEq(e) }
    }
}

/// `custom_error!` requires its field types to implement [`PartialEq`], which
/// [`io::Error`] does not. This thin wrapper forwards everything to the inner
/// error and compares by kind, which is the only thing tests ever need to
/// assert on.
#[derive(Debug)]
pub struct IoErrorEq(pub io::Error);

impl std::fmt::Display for IoErrorEq {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq for IoErrorEq {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for IoErrorEq {
    fn from(e: io::Error) -> Self {
        IoErrorEq(e)
    }
}
