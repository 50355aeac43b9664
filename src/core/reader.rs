use pcsc::{Context, ReaderState, Scope, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::error::{MonitorError, Result};
use crate::core::status::with_event_count;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of an open reader context
///
/// Handles come from a process-wide counter and are never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderHandle(u64);

impl ReaderHandle {
    /// Allocate a handle that has never been used before
    pub fn fresh() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Scope of the reader context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    #[default]
    User,
    System,
}

impl std::str::FromStr for ContextScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ContextScope::User),
            "system" => Ok(ContextScope::System),
            _ => Err(format!("Invalid context scope: {s}")),
        }
    }
}

impl From<ContextScope> for Scope {
    fn from(scope: ContextScope) -> Self {
        match scope {
            ContextScope::User => Scope::User,
            ContextScope::System => Scope::System,
        }
    }
}

/// Operations consumed from the reader subsystem
#[cfg_attr(test, mockall::automock)]
pub trait ReaderBackend {
    /// Open a context
    fn establish_context(&mut self, scope: ContextScope) -> Result<ReaderHandle>;

    /// Enumerate reader names in a stable order
    fn list_readers(&mut self, handle: ReaderHandle) -> Result<Vec<String>>;

    /// Block until the state of at least one reader differs from `current`
    /// or the timeout elapses. New raw state words, card event counter
    /// included, are written to `changed`. Returns `false` on timeout.
    fn wait_status(
        &mut self,
        handle: ReaderHandle,
        timeout: Option<Duration>,
        readers: &[String],
        current: &[State],
        changed: &mut [State],
    ) -> Result<bool>;

    /// Read the ATR of the card in `reader`, `None` when no card answers
    fn status_detail(&mut self, handle: ReaderHandle, reader: &str) -> Result<Option<Vec<u8>>>;

    /// Close a context
    fn release_context(&mut self, handle: ReaderHandle) -> Result<()>;
}

/// Reader backend on top of the system PCSC service
#[derive(Default)]
pub struct PcscBackend {
    contexts: HashMap<ReaderHandle, Context>,
}

impl PcscBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, handle: ReaderHandle) -> Result<&Context> {
        self.contexts
            .get(&handle)
            .ok_or(MonitorError::InvalidHandle(handle.value()))
    }
}

fn reader_cstring(name: &str) -> std::result::Result<CString, String> {
    CString::new(name).map_err(|_| format!("Invalid reader name: {name}"))
}

impl ReaderBackend for PcscBackend {
    fn establish_context(&mut self, scope: ContextScope) -> Result<ReaderHandle> {
        let context =
            Context::establish(scope.into()).map_err(|e| MonitorError::NoContext(e.to_string()))?;

        let handle = ReaderHandle::fresh();
        log::debug!("Established PCSC context {handle}");
        self.contexts.insert(handle, context);
        Ok(handle)
    }

    fn list_readers(&mut self, handle: ReaderHandle) -> Result<Vec<String>> {
        let context = self.context(handle)?;

        match context.list_readers_owned() {
            Ok(readers) => Ok(readers
                .into_iter()
                .map(|name| name.to_string_lossy().to_string())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(MonitorError::EnumerationError(e.to_string())),
        }
    }

    fn wait_status(
        &mut self,
        handle: ReaderHandle,
        timeout: Option<Duration>,
        readers: &[String],
        current: &[State],
        changed: &mut [State],
    ) -> Result<bool> {
        let context = self.context(handle)?;

        let mut states = readers
            .iter()
            .zip(current)
            .map(|(name, &state)| Ok(ReaderState::new(reader_cstring(name)?, state)))
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(MonitorError::StatusWaitError)?;

        match context.get_status_change(timeout, &mut states) {
            Ok(()) => {
                for (slot, state) in changed.iter_mut().zip(&states) {
                    *slot = with_event_count(state.event_state(), state.event_count());
                }
                Ok(true)
            }
            Err(pcsc::Error::Timeout) => Ok(false),
            Err(e) => Err(MonitorError::StatusWaitError(e.to_string())),
        }
    }

    fn status_detail(&mut self, handle: ReaderHandle, reader: &str) -> Result<Option<Vec<u8>>> {
        let context = self.context(handle)?;
        let detail_error = |reason: String| MonitorError::StatusDetailError {
            reader: reader.to_string(),
            reason,
        };

        let name = reader_cstring(reader).map_err(detail_error)?;
        let mut states = [ReaderState::new(name, State::UNAWARE)];
        context
            .get_status_change(Duration::ZERO, &mut states)
            .map_err(|e| detail_error(e.to_string()))?;

        let state = &states[0];
        let atr = state.atr();
        if !state.event_state().contains(State::PRESENT) || atr.is_empty() {
            return Ok(None);
        }

        Ok(Some(atr.to_vec()))
    }

    fn release_context(&mut self, handle: ReaderHandle) -> Result<()> {
        let context = self
            .contexts
            .remove(&handle)
            .ok_or(MonitorError::InvalidHandle(handle.value()))?;

        context
            .release()
            .map_err(|(_, e)| MonitorError::ReleaseError(e.to_string()))?;

        log::debug!("Released PCSC context {handle}");
        Ok(())
    }
}
