use pcsc::State;
use std::time::Duration;

use crate::core::error::{MonitorError, Result};
use crate::core::reader::{ContextScope, ReaderBackend, ReaderHandle};

/// An open reader context
///
/// The handle is released exactly once: by [`ReaderSession::release`], or on
/// drop when the session goes out of scope through an error or a panic.
pub struct ReaderSession<B: ReaderBackend> {
    backend: B,
    handle: Option<ReaderHandle>,
}

impl<B: ReaderBackend> ReaderSession<B> {
    /// Establish a context on `backend`
    ///
    /// On failure the backend is dropped and no release is attempted.
    pub fn acquire(mut backend: B, scope: ContextScope) -> Result<Self> {
        let handle = backend.establish_context(scope)?;
        log::info!("Reader session {handle} opened ({scope:?} scope)");

        Ok(Self {
            backend,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> Option<ReaderHandle> {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// List all available readers
    pub fn list_readers(&mut self) -> Result<Vec<String>> {
        let handle = self.open_handle()?;
        let readers = self.backend.list_readers(handle)?;

        log::debug!("Found {} reader(s)", readers.len());
        for (i, name) in readers.iter().enumerate() {
            log::debug!("  [{i}] {name}");
        }
        Ok(readers)
    }

    pub fn wait_status(
        &mut self,
        timeout: Option<Duration>,
        readers: &[String],
        current: &[State],
        changed: &mut [State],
    ) -> Result<bool> {
        let handle = self.open_handle()?;
        self.backend
            .wait_status(handle, timeout, readers, current, changed)
    }

    pub fn status_detail(&mut self, reader: &str) -> Result<Option<Vec<u8>>> {
        let handle = self.open_handle()?;
        self.backend.status_detail(handle, reader)
    }

    /// Release the context now instead of at end of scope
    pub fn release(mut self) {
        self.release_handle();
    }

    fn open_handle(&self) -> Result<ReaderHandle> {
        self.handle.ok_or(MonitorError::InvalidHandle(0))
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            match self.backend.release_context(handle) {
                Ok(()) => log::info!("Reader session {handle} released"),
                Err(e) => log::warn!("Reader session {handle} released with error: {e}"),
            }
        }
    }
}

impl<B: ReaderBackend> Drop for ReaderSession<B> {
    fn drop(&mut self) {
        self.release_handle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reader::MockReaderBackend;
    use mockall::predicate::eq;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_failed_acquire_never_releases() {
        let mut backend = MockReaderBackend::new();
        backend
            .expect_establish_context()
            .times(1)
            .returning(|_| Err(MonitorError::NoContext("service not running".into())));
        backend.expect_release_context().never();

        let result = ReaderSession::acquire(backend, ContextScope::User);
        assert!(matches!(result, Err(MonitorError::NoContext(_))));
    }

    #[test]
    fn test_explicit_release_runs_once() {
        let handle = ReaderHandle::fresh();
        let mut backend = MockReaderBackend::new();
        backend
            .expect_establish_context()
            .with(eq(ContextScope::System))
            .returning(move |_| Ok(handle));
        backend
            .expect_release_context()
            .with(eq(handle))
            .times(1)
            .returning(|_| Ok(()));

        let session = ReaderSession::acquire(backend, ContextScope::System).unwrap();
        assert_eq!(session.handle(), Some(handle));
        session.release();
    }

    #[test]
    fn test_drop_after_error_releases_once() {
        let handle = ReaderHandle::fresh();
        let mut backend = MockReaderBackend::new();
        backend.expect_establish_context().returning(move |_| Ok(handle));
        backend
            .expect_list_readers()
            .returning(|_| Err(MonitorError::EnumerationError("reader busy".into())));
        backend
            .expect_release_context()
            .times(1)
            .returning(|_| Ok(()));

        let run = |backend: MockReaderBackend| -> Result<Vec<String>> {
            let mut session = ReaderSession::acquire(backend, ContextScope::User)?;
            session.list_readers()
        };

        assert!(matches!(run(backend), Err(MonitorError::EnumerationError(_))));
    }

    #[test]
    fn test_panic_unwind_releases() {
        let handle = ReaderHandle::fresh();
        let mut backend = MockReaderBackend::new();
        backend.expect_establish_context().returning(move |_| Ok(handle));
        backend
            .expect_release_context()
            .times(1)
            .returning(|_| Ok(()));

        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let _session = ReaderSession::acquire(backend, ContextScope::User).unwrap();
            panic!("consumer failure");
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_release_error_is_not_retried() {
        let handle = ReaderHandle::fresh();
        let mut backend = MockReaderBackend::new();
        backend.expect_establish_context().returning(move |_| Ok(handle));
        backend
            .expect_release_context()
            .times(1)
            .returning(|_| Err(MonitorError::ReleaseError("service stopped".into())));

        let session = ReaderSession::acquire(backend, ContextScope::User).unwrap();
        session.release();
    }
}
