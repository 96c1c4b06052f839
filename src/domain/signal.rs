use super::value_objects::Cause;

/// One notification travelling from a hot stream to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    Next(T),
    Complete,
    Error(Cause),
}

impl<T> Signal<T> {
    /// Complete and Error end a subscription; Next does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }
}
