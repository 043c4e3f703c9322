use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Where a connection is in its read → handle → write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    /// Plaintext decrypted during the TLS handshake is waiting to be parsed.
    DataRemaining,
    ReadyToRead,
    ReadingHeadLine,
    HeadersReady,
    ReadingHeaders,
    BodyReady,
    ReadingBody,
    BodyReadyDone,
    RequestReady,
    RequestHandling,
    ReadyToWrite,
    ResponseWriting,
    ResponseWriteCompleted,
    Closed,
}

use ConnectionState::{
    BodyReady, BodyReadyDone, Closed, DataRemaining, HeadersReady, Initialized, ReadingBody, ReadingHeadLine,
    ReadingHeaders, ReadyToRead, ReadyToWrite, RequestHandling, RequestReady, ResponseWriteCompleted, ResponseWriting,
};

impl ConnectionState {
    /// The states this state may be entered from; `None` means any state.
    ///
    /// `ReadyToWrite` is also reachable from the reading states so that a malformed request
    /// can be answered without going through the handler.
    pub fn predecessors(self) -> Option<&'static [ConnectionState]> {
        match self {
            Initialized | Closed => None,
            DataRemaining => Some(&[Initialized]),
            ReadyToRead => Some(&[Initialized, DataRemaining, ResponseWriteCompleted]),
            ReadingHeadLine => Some(&[ReadyToRead, DataRemaining]),
            HeadersReady => Some(&[ReadingHeadLine]),
            ReadingHeaders => Some(&[HeadersReady]),
            BodyReady => Some(&[ReadingHeaders]),
            ReadingBody => Some(&[BodyReady]),
            BodyReadyDone => Some(&[ReadingBody]),
            RequestReady => Some(&[BodyReadyDone]),
            RequestHandling => Some(&[RequestReady]),
            ReadyToWrite => Some(&[
                RequestHandling,
                DataRemaining,
                ReadyToRead,
                ReadingHeadLine,
                HeadersReady,
                ReadingHeaders,
                BodyReady,
                ReadingBody,
            ]),
            ResponseWriting => Some(&[ReadyToWrite]),
            ResponseWriteCompleted => Some(&[ResponseWriting]),
        }
    }

    pub fn can_follow(self, from: ConnectionState) -> bool {
        self.predecessors().is_none_or(|states| states.contains(&from))
    }

    pub fn is_reading(self) -> bool {
        matches!(
            self,
            DataRemaining | ReadyToRead | ReadingHeadLine | HeadersReady | ReadingHeaders | BodyReady | ReadingBody | BodyReadyDone
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal connection state transition from {from} to {to}")]
pub struct IllegalStateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

type Subscription = Box<dyn Fn() + Send>;

/// The current state plus callbacks fired whenever a given state is entered.
pub(crate) struct StateMachine {
    current: ConnectionState,
    subscriptions: HashMap<ConnectionState, Vec<Subscription>>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("subscribed", &self.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self { current: Initialized, subscriptions: HashMap::new() }
    }

    pub(crate) fn when_state_is<F>(&mut self, state: ConnectionState, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.subscriptions.entry(state).or_default().push(Box::new(callback));
    }

    /// Moves to `to` and fires its subscriptions; the current state is kept on error.
    pub(crate) fn change(&mut self, to: ConnectionState) -> Result<(), IllegalStateTransition> {
        let from = self.current;
        if !to.can_follow(from) {
            return Err(IllegalStateTransition { from, to });
        }

        trace!(%from, %to, "connection state changed");
        self.current = to;
        if let Some(callbacks) = self.subscriptions.get(&to) {
            for callback in callbacks {
                callback();
            }
        }
        Ok(())
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.current
    }

    pub(crate) fn is(&self, state: ConnectionState) -> bool {
        self.current == state
    }
}
