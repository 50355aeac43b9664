/// PCSC Card Monitor - watches smart card readers for insertion and removal
///
/// This library provides the reader status poller, the event dispatcher
/// that fans its transitions out to consumers, and an executor that runs
/// external tools against inserted cards.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use core::{
    commands::{CommandExecutor, CommandRequest, CommandResult, CorrelationToken},
    config::MonitorConfig,
    dispatcher::{Delivery, EventDispatcher, SubscriptionId},
    error::{MonitorError, Result},
    events::{CardEvent, Channel, Event, StatusChangeEvent},
    notification::{GateTransition, NotificationGate},
    poller::{PollSummary, PollerConfig, PollerHandle, StatusPoller, StopSignal},
    reader::{ContextScope, PcscBackend, ReaderBackend, ReaderHandle},
    session::ReaderSession,
    status::{event_count, with_event_count, ReaderStatus, StatusSnapshot},
    utils::{decode_atr, encode_atr},
};
