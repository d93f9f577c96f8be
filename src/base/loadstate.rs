/// Where a request is in its submission cycle.
/// One request walks this loop once per leg (retry, redirect, auth).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoadState {
    /// Created, not yet submitted.
    #[default]
    Created = 0,

    /// Looking up a service point and connection.
    Submitting = 1,

    /// Queued on a connection's wait list.
    AwaitingConnection = 2,

    /// Establishing the transport (TCP handshake, tunnel).
    Connecting = 3,

    /// Sending the request line, headers or body.
    Writing = 4,

    /// Headers sent, holding the body until `100 Continue` or the timer.
    AwaitingContinue = 5,

    /// Waiting for the server response (TTFB).
    AwaitingResponse = 6,

    /// Redirect, auth or retry decided; about to submit again.
    Resubmitting = 7,

    /// A final response was handed to the caller.
    Complete = 8,

    /// A terminal error was handed to the caller.
    Faulted = 9,
}

impl LoadState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadState::Submitting,
            2 => LoadState::AwaitingConnection,
            3 => LoadState::Connecting,
            4 => LoadState::Writing,
            5 => LoadState::AwaitingContinue,
            6 => LoadState::AwaitingResponse,
            7 => LoadState::Resubmitting,
            8 => LoadState::Complete,
            9 => LoadState::Faulted,
            _ => LoadState::Created,
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Complete | LoadState::Faulted)
    }
}
