//! SENDME flow control
//!
//! Each circuit and each stream carries two windows:
//!
//! - the **package window** counts cells we may still send; it decrements
//!   per RELAY_DATA we package and is replenished by an inbound SENDME.
//! - the **deliver window** counts cells the peer may still send us; it
//!   decrements per RELAY_DATA we deliver, and once enough cells have been
//!   consumed we owe the peer a SENDME and credit the window back.
//!
//! Window values: 1000 initial / 100 increment per circuit, 500 / 50 per
//! stream. A SENDME is owed as soon as the deliver window falls to
//! initial − increment.

use crate::error::{Result, TorError};

/// Circuit-level flow control windows.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    package_window: u16,
    deliver_window: u16,
}

impl CircuitFlowControl {
    /// Initial circuit window size
    pub const INITIAL_WINDOW: u16 = 1000;

    /// Window increment per SENDME
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    /// Whether a RELAY_DATA cell may be packaged right now.
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one packaged RELAY_DATA cell.
    pub fn on_package(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::WindowExhausted);
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Inbound circuit-level SENDME: more cells may be sent.
    pub fn on_sendme(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
        log::debug!(
            "circuit package window: {} (+{})",
            self.package_window,
            Self::WINDOW_INCREMENT
        );
    }

    /// Account for one delivered RELAY_DATA cell.
    ///
    /// Returns `true` when a circuit-level SENDME is now owed; the window
    /// is credited back at the same moment.
    pub fn on_deliver(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            log::debug!("circuit deliver window refilled, SENDME owed");
            return true;
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn package_window(&self) -> u16 {
        self.package_window
    }

    #[cfg(test)]
    pub(crate) fn deliver_window(&self) -> u16 {
        self.deliver_window
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control windows.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    package_window: u16,
    deliver_window: u16,
    stream_id: u16,
}

impl StreamFlowControl {
    /// Initial stream window size
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per SENDME
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
            stream_id,
        }
    }

    /// Whether a RELAY_DATA cell may be packaged right now.
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one packaged RELAY_DATA cell.
    pub fn on_package(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::WindowExhausted);
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Inbound stream-level SENDME.
    pub fn on_sendme(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
        log::debug!(
            "stream {} package window: {} (+{})",
            self.stream_id,
            self.package_window,
            Self::WINDOW_INCREMENT
        );
    }

    /// Account for one delivered RELAY_DATA cell; `true` when a SENDME for
    /// this stream is owed.
    pub fn on_deliver(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            log::debug!("stream {} deliver window refilled, SENDME owed", self.stream_id);
            return true;
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn package_window(&self) -> u16 {
        self.package_window
    }
}
