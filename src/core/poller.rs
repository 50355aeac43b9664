use pcsc::State;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::dispatcher::EventDispatcher;
use crate::core::error::{MonitorError, Result};
use crate::core::events::{CardEvent, Event, StatusChangeEvent, DEFAULT_CARD_LABEL};
use crate::core::reader::{ContextScope, ReaderBackend};
use crate::core::session::ReaderSession;
use crate::core::status::{ReaderStatus, StatusSnapshot};
use crate::core::utils::encode_atr;

/// Settings of one polling session
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub scope: ContextScope,
    /// `None` waits forever
    pub timeout: Option<Duration>,
    pub card_label: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            scope: ContextScope::User,
            timeout: None,
            card_label: DEFAULT_CARD_LABEL.to_string(),
        }
    }
}

/// Cooperative stop flag, checked once per completed poll cycle
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Totals of a session that ended on a stop request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub cycles: u64,
    pub events: u64,
}

#[derive(Debug, Default)]
struct CycleReport {
    events: u64,
    rescan: bool,
}

/// Long-running reader status monitor
///
/// Owns the backend, opens a [`ReaderSession`] when run and publishes every
/// detected transition on the dispatcher. The session is released on every
/// exit path, and a new run always starts from a fresh snapshot.
pub struct StatusPoller<B: ReaderBackend> {
    backend: B,
    dispatcher: Arc<EventDispatcher>,
    config: PollerConfig,
    stop: StopSignal,
}

impl<B: ReaderBackend> StatusPoller<B> {
    pub fn new(backend: B, dispatcher: Arc<EventDispatcher>, config: PollerConfig) -> Self {
        Self {
            backend,
            dispatcher,
            config,
            stop: StopSignal::new(),
        }
    }

    /// Share a stop signal owned by a supervisor
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Poll on the current thread until stopped or a fatal error occurs
    pub fn run(self) -> Result<PollSummary> {
        let StatusPoller {
            backend,
            dispatcher,
            config,
            stop,
        } = self;

        let mut session = ReaderSession::acquire(backend, config.scope)?;

        let result = monitor(&mut session, &dispatcher, &config, &stop);
        match &result {
            Ok(summary) => log::info!(
                "Status poller stopped after {} cycle(s), {} event(s)",
                summary.cycles,
                summary.events
            ),
            Err(MonitorError::NoReadersFound) => {
                log::warn!("No readers found. Rescan to try again.")
            }
            Err(e) => log::error!("Status poller terminated: {e}"),
        }

        session.release();
        result
    }

    /// Poll on a dedicated thread
    pub fn spawn(self) -> Result<PollerHandle>
    where
        B: Send + 'static,
    {
        let stop = self.stop.clone();
        let thread = thread::Builder::new()
            .name("status-poller".to_string())
            .spawn(move || self.run())
            .map_err(|e| MonitorError::ThreadSpawn(e.to_string()))?;

        Ok(PollerHandle { stop, thread })
    }
}

fn monitor<B: ReaderBackend>(
    session: &mut ReaderSession<B>,
    dispatcher: &EventDispatcher,
    config: &PollerConfig,
    stop: &StopSignal,
) -> Result<PollSummary> {
    let readers = session.list_readers()?;
    if readers.is_empty() {
        return Err(MonitorError::NoReadersFound);
    }
    log::info!("Monitoring {} reader(s)", readers.len());

    let mut snapshot = StatusSnapshot::new(readers);
    let mut summary = PollSummary::default();

    loop {
        let report = poll_cycle(session, &mut snapshot, dispatcher, config)?;
        summary.cycles += 1;
        summary.events += report.events;

        if report.rescan {
            let readers = session.list_readers()?;
            if readers.is_empty() {
                return Err(MonitorError::NoReadersFound);
            }
            snapshot.reconcile(readers);
            log::info!("Re-read readers, now tracking {}", snapshot.len());
        }

        if stop.is_raised() {
            return Ok(summary);
        }
    }
}

fn poll_cycle<B: ReaderBackend>(
    session: &mut ReaderSession<B>,
    snapshot: &mut StatusSnapshot,
    dispatcher: &EventDispatcher,
    config: &PollerConfig,
) -> Result<CycleReport> {
    let names = snapshot.names();
    let current = snapshot.current_flags();
    let mut changed = vec![State::UNAWARE; names.len()];

    let mut report = CycleReport::default();
    if !session.wait_status(config.timeout, &names, &current, &mut changed)? {
        log::debug!("Status wait timed out");
        return Ok(report);
    }

    let mut events = Vec::new();
    for index in snapshot.adopt(&changed) {
        let name = snapshot.entry(index).name.clone();
        let flags = snapshot.entry(index).flags;

        if flags.contains(State::UNKNOWN) {
            log::warn!("Reader {name} unknown - re-reading readers");
            report.rescan = true;
        }

        let mut status = ReaderStatus::reduce(flags);
        let atr = if status.implies_card() {
            let atr = session.status_detail(&name)?;
            if atr.is_none() {
                log::info!("No card on reader: {name}");
                status = ReaderStatus::Empty;
            }
            atr
        } else {
            None
        };

        snapshot.set_status(index, status);
        log::info!("Reader {index} {name}: {status}");
        events.push(StatusChangeEvent::new(name, status, atr));
    }

    for event in events {
        let card = event.atr.clone().map(|atr| CardEvent {
            reader: event.reader.clone(),
            atr,
            label: config.card_label.clone(),
        });

        dispatcher.publish(&Event::ReaderStatus(event));
        report.events += 1;

        if let Some(card) = card {
            log::info!(
                "Found card on reader {}: ATR {}",
                card.reader,
                encode_atr(&card.atr)
            );
            dispatcher.publish(&Event::CardEvent(card));
        }
    }

    Ok(report)
}

/// Handle to a poller running on its own thread
pub struct PollerHandle {
    stop: StopSignal,
    thread: JoinHandle<Result<PollSummary>>,
}

impl PollerHandle {
    /// Ask the poller to stop after its current wait completes
    pub fn stop(&self) {
        self.stop.raise();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<PollSummary> {
        self.thread
            .join()
            .unwrap_or(Err(MonitorError::PollerPanicked))
    }
}
