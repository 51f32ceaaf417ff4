//! Per-connection shutdown state.
//!
//! A TCP connection is a pair of independent half-duplex directions.
//! [`ShutdownState`] records, for each direction, whether it is still
//! open, has been shut down locally, or is gone because the connection
//! was closed. It also records what was *observed* on the wire
//! (end-of-stream, reset) separately from what was *done* locally:
//! reading end-of-stream never marks the input as shut down, exactly like
//! the kernel, which keeps the read side usable until `shutdown(SHUT_RD)`
//! or `close`.
//!
//! ```text
//!            shutdown_input / shutdown_output
//! BothOpen ───────────────────────────────────▶ HalfShut
//!    │                                            │ the other direction
//!    │                                            ▼
//!    │                                         FullShut
//!    │  close (from any phase)                    │
//!    └──────────────────────▶ Closed ◀────────────┘
//! ```
//!
//! Every transition is a compare-and-set on an atomic, so the reader
//! thread, the writer thread and the owner may all consult the state
//! without holding a lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::trace;

/// State of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DirectionState {
    /// Data may flow in this direction.
    Open = 0,
    /// The direction was shut down locally.
    Shutdown = 1,
    /// The connection was closed; the direction no longer exists.
    Closed = 2,
}

impl DirectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DirectionState::Open,
            1 => DirectionState::Shutdown,
            _ => DirectionState::Closed,
        }
    }
}

/// Whole-connection phase derived from both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Both directions are open.
    BothOpen,
    /// Exactly one direction is shut down.
    HalfShut,
    /// Both directions are shut down but the connection is not closed.
    FullShut,
    /// The connection is closed. Terminal.
    Closed,
}

/// Result of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed; the caller owns the side effect (syscall).
    Applied,
    /// The target state was already reached. Nothing to do.
    AlreadyDone,
    /// The connection is closed; the transition is not possible.
    Closed,
}

/// Independent read/write shutdown flags of one connection.
pub struct ShutdownState {
    input: AtomicU8,
    output: AtomicU8,
    closed: AtomicBool,
    eof_observed: AtomicBool,
    reset_observed: AtomicBool,
}

impl ShutdownState {
    /// Creates the state of a freshly connected channel.
    pub fn new() -> Self {
        Self {
            input: AtomicU8::new(DirectionState::Open as u8),
            output: AtomicU8::new(DirectionState::Open as u8),
            closed: AtomicBool::new(false),
            eof_observed: AtomicBool::new(false),
            reset_observed: AtomicBool::new(false),
        }
    }

    pub fn input(&self) -> DirectionState {
        DirectionState::from_u8(self.input.load(Ordering::Acquire))
    }

    pub fn output(&self) -> DirectionState {
        DirectionState::from_u8(self.output.load(Ordering::Acquire))
    }

    /// `true` once the input was shut down locally or the connection closed.
    ///
    /// Reading end-of-stream does not set this flag.
    pub fn is_input_shutdown(&self) -> bool {
        self.input() != DirectionState::Open
    }

    /// `true` once the output was shut down locally or the connection closed.
    pub fn is_output_shutdown(&self) -> bool {
        self.output() != DirectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the whole-connection phase.
    pub fn phase(&self) -> Phase {
        if self.is_closed() {
            return Phase::Closed;
        }

        match (self.is_input_shutdown(), self.is_output_shutdown()) {
            (false, false) => Phase::BothOpen,
            (true, true) => Phase::FullShut,
            _ => Phase::HalfShut,
        }
    }

    /// Moves the input direction from open to shut down.
    pub fn shutdown_input(&self) -> Transition {
        let transition = advance(&self.input);
        trace!(?transition, phase = ?self.phase(), "shutdown input");
        transition
    }

    /// Moves the output direction from open to shut down.
    pub fn shutdown_output(&self) -> Transition {
        let transition = advance(&self.output);
        trace!(?transition, phase = ?self.phase(), "shutdown output");
        transition
    }

    /// Closes the connection from any phase.
    ///
    /// Returns [`Transition::Applied`] only for the first call, so exactly
    /// one caller releases the descriptor.
    pub fn close(&self) -> Transition {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Transition::AlreadyDone;
        }

        self.input.store(DirectionState::Closed as u8, Ordering::Release);
        self.output.store(DirectionState::Closed as u8, Ordering::Release);

        trace!("connection closed");
        Transition::Applied
    }

    /// Records that a read returned end-of-stream.
    ///
    /// This is an observation only; local state is unchanged.
    pub fn observe_eof(&self) {
        if !self.eof_observed.swap(true, Ordering::AcqRel) {
            trace!("end-of-stream observed");
        }
    }

    /// Records that the peer reset the connection.
    pub fn observe_reset(&self) {
        if !self.reset_observed.swap(true, Ordering::AcqRel) {
            trace!("connection reset observed");
        }
    }

    /// `true` once any read returned end-of-stream.
    pub fn eof_observed(&self) -> bool {
        self.eof_observed.load(Ordering::Acquire)
    }

    /// `true` once any I/O call failed with a reset.
    pub fn reset_observed(&self) -> bool {
        self.reset_observed.load(Ordering::Acquire)
    }
}

/// Open → Shutdown, never touching a closed direction.
fn advance(direction: &AtomicU8) -> Transition {
    match direction.compare_exchange(
        DirectionState::Open as u8,
        DirectionState::Shutdown as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Transition::Applied,
        Err(current) if current == DirectionState::Shutdown as u8 => Transition::AlreadyDone,
        Err(_) => Transition::Closed,
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownState")
            .field("input", &self.input())
            .field("output", &self.output())
            .field("phase", &self.phase())
            .field("eof_observed", &self.eof_observed())
            .field("reset_observed", &self.reset_observed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_half_close_then_full_shut() {
        let state = ShutdownState::new();
        assert_eq!(state.phase(), Phase::BothOpen);

        assert_eq!(state.shutdown_output(), Transition::Applied);
        assert_eq!(state.phase(), Phase::HalfShut);
        assert!(state.is_output_shutdown());
        assert!(!state.is_input_shutdown());

        assert_eq!(state.shutdown_output(), Transition::AlreadyDone);

        assert_eq!(state.shutdown_input(), Transition::Applied);
        assert_eq!(state.phase(), Phase::FullShut);
        assert!(!state.is_closed());

        assert_eq!(state.close(), Transition::Applied);
        assert_eq!(state.phase(), Phase::Closed);
    }

    #[test]
    fn test_eof_is_an_observation_only() {
        let state = ShutdownState::new();

        state.observe_eof();
        state.observe_eof();

        assert!(state.eof_observed());
        assert!(!state.is_input_shutdown());
        assert_eq!(state.phase(), Phase::BothOpen);
    }

    #[test]
    fn test_close_from_open_skips_shutdown() {
        let state = ShutdownState::new();

        assert_eq!(state.close(), Transition::Applied);
        assert_eq!(state.close(), Transition::AlreadyDone);
        assert_eq!(state.input(), DirectionState::Closed);
        assert_eq!(state.output(), DirectionState::Closed);
        assert_eq!(state.shutdown_input(), Transition::Closed);
        assert_eq!(state.shutdown_output(), Transition::Closed);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        ShutIn,
        ShutOut,
        Close,
        Eof,
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::ShutIn),
            Just(Op::ShutOut),
            Just(Op::Close),
            Just(Op::Eof),
            Just(Op::Reset),
        ]
    }

    proptest! {
        #[test]
        fn prop_directions_never_reopen(ops in proptest::collection::vec(op(), 0..48)) {
            let state = ShutdownState::new();
            let mut input = state.input();
            let mut output = state.output();
            let mut closes = 0;

            for op in ops {
                match op {
                    Op::ShutIn => { state.shutdown_input(); }
                    Op::ShutOut => { state.shutdown_output(); }
                    Op::Close => {
                        if state.close() == Transition::Applied {
                            closes += 1;
                        }
                    }
                    Op::Eof => state.observe_eof(),
                    Op::Reset => state.observe_reset(),
                }

                prop_assert!(state.input() as u8 >= input as u8);
                prop_assert!(state.output() as u8 >= output as u8);
                input = state.input();
                output = state.output();

                if state.is_closed() {
                    prop_assert_eq!(state.phase(), Phase::Closed);
                    prop_assert_eq!(input, DirectionState::Closed);
                    prop_assert_eq!(output, DirectionState::Closed);
                }
            }

            prop_assert!(closes <= 1);
        }

        #[test]
        fn prop_observations_never_touch_flags(eofs in 0usize..8, resets in 0usize..8) {
            let state = ShutdownState::new();

            for _ in 0..eofs {
                state.observe_eof();
            }
            for _ in 0..resets {
                state.observe_reset();
            }

            prop_assert_eq!(state.phase(), Phase::BothOpen);
            prop_assert_eq!(state.eof_observed(), eofs > 0);
            prop_assert_eq!(state.reset_observed(), resets > 0);
        }
    }
}
