//! Lazy iteration over a pull-style cursor.
//!
//! A cursor exposes `start`, `advance` and `current`. The
//! [`ReaderIteratorAdapter`] turns it into "is there more?" / "give me
//! the next one" while guaranteeing `start` runs at most once and no
//! cursor call happens before it is needed. The transitions live on
//! [`ReadState`] so they can be checked without any cursor at all.

use crate::errors::SourceError;
use crate::source::Timestamped;

/// Where the adapter is relative to its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// `start` has not been called.
    BeforeStart,
    /// The last record was taken; `advance` has not been called.
    BeforeAdvance,
    /// The cursor is positioned on an untaken record.
    Available,
    /// The cursor reported no more data, or failed.
    Exhausted,
}

/// The cursor call needed to answer "is there more?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorCall {
    Start,
    Advance,
}

impl ReadState {
    /// Initial state of an adapter. A reader that was already started
    /// elsewhere (e.g. restored from a previous bundle) must only be
    /// advanced.
    pub fn initial(started: bool) -> Self {
        if started {
            ReadState::BeforeAdvance
        } else {
            ReadState::BeforeStart
        }
    }

    /// Cursor call "is there more?" must make in this state, if any.
    pub fn pending_call(self) -> Option<CursorCall> {
        match self {
            ReadState::BeforeStart => Some(CursorCall::Start),
            ReadState::BeforeAdvance => Some(CursorCall::Advance),
            ReadState::Available | ReadState::Exhausted => None,
        }
    }

    /// State after the pending cursor call reported `available`.
    pub fn after_call(self, available: bool) -> Self {
        match self {
            ReadState::BeforeStart | ReadState::BeforeAdvance => {
                if available {
                    ReadState::Available
                } else {
                    ReadState::Exhausted
                }
            }
            state => state,
        }
    }

    /// State after the available record was taken.
    pub fn after_take(self) -> Self {
        match self {
            ReadState::Available => ReadState::BeforeAdvance,
            state => state,
        }
    }

    pub fn has_record(self) -> bool {
        self == ReadState::Available
    }

    /// State to resume from when a reader is handed to a later
    /// bundle. An untaken record stays available. A reader that ran
    /// dry may have more by then, so it is advanced again.
    pub fn parked(self) -> Self {
        match self {
            ReadState::Exhausted => ReadState::BeforeAdvance,
            state => state,
        }
    }
}

/// A pull-style cursor the adapter can drive.
pub trait Cursor {
    type Item;

    fn start(&mut self) -> Result<bool, SourceError>;

    fn advance(&mut self) -> Result<bool, SourceError>;

    /// The record under the cursor.
    fn current(&mut self) -> Result<Timestamped<Self::Item>, SourceError>;

    /// Debug form of the Source being read, for error reports.
    fn describe(&self) -> String;
}

/// "has next / take next" over any [`Cursor`].
#[derive(Debug)]
pub struct ReaderIteratorAdapter<C> {
    cursor: C,
    state: ReadState,
}

impl<C: Cursor> ReaderIteratorAdapter<C> {
    pub fn new(cursor: C, started: bool) -> Self {
        Self {
            cursor,
            state: ReadState::initial(started),
        }
    }

    /// Pick up a cursor that an earlier adapter left in `state`.
    pub fn resume(cursor: C, state: ReadState) -> Self {
        Self { cursor, state }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn cursor(&self) -> &C {
        &self.cursor
    }

    pub fn into_cursor(self) -> C {
        self.cursor
    }

    /// Whether a record can be taken, moving the cursor if needed.
    ///
    /// A failed cursor call leaves the adapter exhausted; `start` is
    /// never retried.
    pub fn has_next(&mut self) -> Result<bool, SourceError> {
        let Some(call) = self.state.pending_call() else {
            return Ok(self.state.has_record());
        };
        let res = match call {
            CursorCall::Start => self.cursor.start().map_err(|err| SourceError::ReadStart {
                source_description: self.cursor.describe(),
                cause: Box::new(err),
            }),
            CursorCall::Advance => {
                self.cursor
                    .advance()
                    .map_err(|err| SourceError::ReadAdvance {
                        source_description: self.cursor.describe(),
                        cause: Box::new(err),
                    })
            }
        };
        match res {
            Ok(available) => {
                self.state = self.state.after_call(available);
                Ok(available)
            }
            Err(err) => {
                self.state = ReadState::Exhausted;
                Err(err)
            }
        }
    }

    /// Take the record under the cursor.
    pub fn take_next(&mut self) -> Result<Timestamped<C::Item>, SourceError> {
        if !self.has_next()? {
            return Err(SourceError::NoSuchElement);
        }
        let item = self.cursor.current()?;
        self.state = self.state.after_take();
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    /// Yields `0..len`, counting cursor calls.
    #[derive(Debug, Default)]
    struct ScriptedCursor {
        len: u32,
        pos: u32,
        starts: u32,
        advances: u32,
        fail_advance_at: Option<u32>,
    }

    impl Cursor for ScriptedCursor {
        type Item = u32;

        fn start(&mut self) -> Result<bool, SourceError> {
            self.starts += 1;
            self.pos = 0;
            Ok(self.pos < self.len)
        }

        fn advance(&mut self) -> Result<bool, SourceError> {
            self.advances += 1;
            self.pos += 1;
            if Some(self.pos) == self.fail_advance_at {
                return Err(SourceError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "scripted failure",
                )));
            }
            Ok(self.pos < self.len)
        }

        fn current(&mut self) -> Result<Timestamped<u32>, SourceError> {
            Ok(Timestamped::new(self.pos, DateTime::<Utc>::MIN_UTC))
        }

        fn describe(&self) -> String {
            format!("ScriptedCursor(len={})", self.len)
        }
    }

    fn drain(adapter: &mut ReaderIteratorAdapter<ScriptedCursor>) -> Vec<u32> {
        let mut out = Vec::new();
        while adapter.has_next().unwrap() {
            out.push(adapter.take_next().unwrap().value);
        }
        out
    }

    #[test]
    fn transitions_are_exhaustive() {
        use ReadState::*;
        assert_eq!(ReadState::initial(false), BeforeStart);
        assert_eq!(ReadState::initial(true), BeforeAdvance);
        assert_eq!(BeforeStart.pending_call(), Some(CursorCall::Start));
        assert_eq!(BeforeAdvance.pending_call(), Some(CursorCall::Advance));
        assert_eq!(Available.pending_call(), None);
        assert_eq!(Exhausted.pending_call(), None);
        assert_eq!(BeforeStart.after_call(true), Available);
        assert_eq!(BeforeAdvance.after_call(false), Exhausted);
        assert_eq!(Available.after_call(false), Available);
        assert_eq!(Available.after_take(), BeforeAdvance);
        assert_eq!(Exhausted.after_take(), Exhausted);
        assert_eq!(Available.parked(), Available);
        assert_eq!(Exhausted.parked(), BeforeAdvance);
        assert_eq!(BeforeStart.parked(), BeforeStart);
    }

    #[test]
    fn start_is_called_once() {
        let mut adapter = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 3,
                ..Default::default()
            },
            false,
        );
        assert_eq!(drain(&mut adapter), vec![0, 1, 2]);
        assert!(!adapter.has_next().unwrap());
        assert_eq!(adapter.cursor().starts, 1);
        assert_eq!(adapter.cursor().advances, 3);
    }

    #[test]
    fn started_reader_is_never_restarted() {
        let mut adapter = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 3,
                ..Default::default()
            },
            true,
        );
        assert_eq!(drain(&mut adapter), vec![1, 2]);
        assert_eq!(adapter.cursor().starts, 0);
    }

    #[test]
    fn has_next_is_idempotent_while_available() {
        let mut adapter = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 2,
                ..Default::default()
            },
            false,
        );
        assert!(adapter.has_next().unwrap());
        assert!(adapter.has_next().unwrap());
        assert_eq!(adapter.cursor().starts, 1);
        assert_eq!(adapter.cursor().advances, 0);
    }

    #[test]
    fn resumed_adapter_keeps_untaken_record() {
        let mut first = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 3,
                ..Default::default()
            },
            false,
        );
        assert_eq!(first.take_next().unwrap().value, 0);
        assert!(first.has_next().unwrap());
        let state = first.state().parked();
        let mut second = ReaderIteratorAdapter::resume(first.into_cursor(), state);
        assert_eq!(drain(&mut second), vec![1, 2]);
        assert_eq!(second.cursor().starts, 1);
    }

    #[test]
    fn take_next_when_exhausted_fails() {
        let mut adapter = ReaderIteratorAdapter::new(ScriptedCursor::default(), false);
        assert!(matches!(
            adapter.take_next(),
            Err(SourceError::NoSuchElement)
        ));
        assert_eq!(adapter.state(), ReadState::Exhausted);
        assert!(matches!(
            adapter.take_next(),
            Err(SourceError::NoSuchElement)
        ));
        assert_eq!(adapter.cursor().starts, 1);
    }

    #[test]
    fn take_next_on_fresh_adapter_starts() {
        let mut adapter = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 1,
                ..Default::default()
            },
            false,
        );
        assert_eq!(adapter.take_next().unwrap().value, 0);
        assert_eq!(adapter.state(), ReadState::BeforeAdvance);
    }

    #[test]
    fn advance_failure_is_wrapped_with_source() {
        let mut adapter = ReaderIteratorAdapter::new(
            ScriptedCursor {
                len: 5,
                fail_advance_at: Some(2),
                ..Default::default()
            },
            false,
        );
        adapter.take_next().unwrap();
        adapter.take_next().unwrap();
        match adapter.has_next() {
            Err(SourceError::ReadAdvance {
                source_description, ..
            }) => assert_eq!(source_description, "ScriptedCursor(len=5)"),
            other => panic!("expected ReadAdvance, got {other:?}"),
        }
        assert_eq!(adapter.state(), ReadState::Exhausted);
    }
}
