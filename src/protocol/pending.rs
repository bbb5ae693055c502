//! Work deferred until the bus is released.

/// An operation accepted during a transaction but executed after it, so
/// the host is not kept waiting on slow radio or storage work.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PendingOperation {
    #[default]
    None,
    /// Connect as a station, to the named network or the best known one.
    StartClient(Option<Vec<u8>>),
    StartAccessPoint,
    Stop,
    FactoryReset,
    Diagnostics,
    /// New bus clock divider.
    SetClock(u32),
}

impl PendingOperation {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}
