use pcsc::ffi::DWORD;
use pcsc::State;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dominant status of a reader, reduced from the raw PCSC state word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Unaware,
    Unknown,
    Ignore,
    Unavailable,
    Empty,
    Present,
    AtrMatch,
    Exclusive,
    InUse,
    Mute,
    Changed,
}

/// Reduction order, highest priority first
const PRIORITY: [(State, ReaderStatus); 8] = [
    (State::IGNORE, ReaderStatus::Ignore),
    (State::UNAVAILABLE, ReaderStatus::Unavailable),
    (State::EMPTY, ReaderStatus::Empty),
    (State::PRESENT, ReaderStatus::Present),
    (State::ATRMATCH, ReaderStatus::AtrMatch),
    (State::EXCLUSIVE, ReaderStatus::Exclusive),
    (State::INUSE, ReaderStatus::InUse),
    (State::MUTE, ReaderStatus::Mute),
];

/// Position of the card event counter in the high half of a raw state word
const EVENT_COUNT_SHIFT: u32 = 16;

/// Raw state word carrying `flags` and the card event counter `count`
///
/// The counter goes back to the service with the next status wait. Without
/// it the reader is always reported as changed.
pub fn with_event_count(flags: State, count: u32) -> State {
    let counter = DWORD::from((count & 0xFFFF) as u16) << EVENT_COUNT_SHIFT;
    State::from_bits_retain(State::from_bits_truncate(flags.bits()).bits() | counter)
}

/// Card event counter of a raw state word, bumped on every insertion or removal
pub fn event_count(flags: State) -> u32 {
    ((flags.bits() >> EVENT_COUNT_SHIFT) & 0xFFFF) as u32
}

/// Status flags of a raw state word without the change marker and the counter
fn status_bits(flags: State) -> State {
    State::from_bits_truncate(flags.bits()).difference(State::CHANGED)
}

impl ReaderStatus {
    /// Reduce a raw state word to one dominant status. First matching flag wins.
    pub fn reduce(flags: State) -> Self {
        PRIORITY
            .iter()
            .find(|(flag, _)| flags.contains(*flag))
            .map(|(_, status)| *status)
            .unwrap_or(ReaderStatus::Unknown)
    }

    /// Whether a card may be in the reader
    pub fn implies_card(self) -> bool {
        matches!(
            self,
            ReaderStatus::Present
                | ReaderStatus::AtrMatch
                | ReaderStatus::Exclusive
                | ReaderStatus::InUse
        )
    }

    /// Whether the status states that there is no usable card in the reader
    pub fn is_no_card(self) -> bool {
        matches!(
            self,
            ReaderStatus::Empty
                | ReaderStatus::Unavailable
                | ReaderStatus::Ignore
                | ReaderStatus::Unknown
        )
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReaderStatus::Unaware => "Unaware",
            ReaderStatus::Unknown => "Reader unknown",
            ReaderStatus::Ignore => "Ignored",
            ReaderStatus::Unavailable => "Status unavailable",
            ReaderStatus::Empty => "Card removed",
            ReaderStatus::Present => "Card inserted",
            ReaderStatus::AtrMatch => "ATR matches card",
            ReaderStatus::Exclusive => "Exclusive mode",
            ReaderStatus::InUse => "Shared mode",
            ReaderStatus::Mute => "Unresponsive card",
            ReaderStatus::Changed => "Changed",
        };
        f.write_str(text)
    }
}

/// Last observed state of one tracked reader
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedReader {
    pub name: String,
    pub flags: State,
    pub status: ReaderStatus,
}

impl TrackedReader {
    fn new(name: String) -> Self {
        Self {
            name,
            flags: State::UNAWARE,
            status: ReaderStatus::Unaware,
        }
    }
}

/// Last observed state of every tracked reader, in enumeration order
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    readers: Vec<TrackedReader>,
}

impl StatusSnapshot {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            readers: names.into_iter().map(TrackedReader::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.name.clone()).collect()
    }

    /// Raw state words, event counter included, to hand back to the status
    /// wait as the known state
    pub fn current_flags(&self) -> Vec<State> {
        self.readers.iter().map(|r| r.flags).collect()
    }

    pub fn get(&self, name: &str) -> Option<&TrackedReader> {
        self.readers.iter().find(|r| r.name == name)
    }

    pub fn entry(&self, index: usize) -> &TrackedReader {
        &self.readers[index]
    }

    pub fn set_status(&mut self, index: usize, status: ReaderStatus) {
        self.readers[index].status = status;
    }

    /// Adopt the flags of every reader that reports a change and return the
    /// indices whose state really moved. A change marker over identical flags
    /// and an unchanged event counter is absorbed without a transition; a
    /// bumped counter means the card was swapped between two waits.
    pub fn adopt(&mut self, changed: &[State]) -> Vec<usize> {
        let mut transitioned = Vec::new();

        for (index, (reader, &flags)) in self.readers.iter_mut().zip(changed).enumerate() {
            if !flags.contains(State::CHANGED) {
                continue;
            }

            let moved = status_bits(flags) != status_bits(reader.flags)
                || event_count(flags) != event_count(reader.flags);
            reader.flags = flags;
            if moved {
                transitioned.push(index);
            }
        }

        transitioned
    }

    /// Rebuild the snapshot for a new reader list. Readers that are still
    /// present keep their last state; new ones start unaware.
    pub fn reconcile(&mut self, names: Vec<String>) {
        let mut previous = std::mem::take(&mut self.readers);
        self.readers = names
            .into_iter()
            .map(|name| match previous.iter().position(|r| r.name == name) {
                Some(pos) => previous.swap_remove(pos),
                None => TrackedReader::new(name),
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_priority() {
        assert_eq!(
            ReaderStatus::reduce(State::PRESENT | State::MUTE),
            ReaderStatus::Present
        );
        assert_eq!(
            ReaderStatus::reduce(State::PRESENT | State::INUSE | State::CHANGED),
            ReaderStatus::Present
        );
        assert_eq!(
            ReaderStatus::reduce(State::EMPTY | State::CHANGED),
            ReaderStatus::Empty
        );
        assert_eq!(
            ReaderStatus::reduce(State::IGNORE | State::UNAVAILABLE | State::EMPTY),
            ReaderStatus::Ignore
        );
        assert_eq!(
            ReaderStatus::reduce(State::EXCLUSIVE | State::INUSE),
            ReaderStatus::Exclusive
        );
        assert_eq!(ReaderStatus::reduce(State::MUTE), ReaderStatus::Mute);
    }

    #[test]
    fn test_reduce_without_match_is_unknown() {
        assert_eq!(ReaderStatus::reduce(State::UNAWARE), ReaderStatus::Unknown);
        assert_eq!(
            ReaderStatus::reduce(State::CHANGED | State::UNKNOWN),
            ReaderStatus::Unknown
        );
    }

    #[test]
    fn test_card_classification() {
        assert!(ReaderStatus::Present.implies_card());
        assert!(ReaderStatus::InUse.implies_card());
        assert!(!ReaderStatus::Mute.implies_card());
        assert!(!ReaderStatus::Empty.implies_card());

        assert!(ReaderStatus::Empty.is_no_card());
        assert!(!ReaderStatus::Mute.is_no_card());
        assert!(!ReaderStatus::Present.is_no_card());
    }

    #[test]
    fn test_adopt_reports_only_real_transitions() {
        let mut snapshot = StatusSnapshot::new(vec!["Reader0".into(), "Reader1".into()]);

        let moved = snapshot.adopt(&[State::PRESENT | State::CHANGED, State::EMPTY]);
        assert_eq!(moved, vec![0]);
        assert_eq!(snapshot.entry(0).flags, State::PRESENT | State::CHANGED);
        assert_eq!(snapshot.entry(1).flags, State::UNAWARE);

        // Same flags flagged as changed again: adopted, no transition
        let moved = snapshot.adopt(&[State::PRESENT | State::CHANGED, State::UNAWARE]);
        assert!(moved.is_empty());

        let moved = snapshot.adopt(&[
            State::EMPTY | State::CHANGED,
            State::EMPTY | State::CHANGED,
        ]);
        assert_eq!(moved, vec![0, 1]);
    }

    #[test]
    fn test_event_count_survives_in_state_word() {
        let raw = with_event_count(State::PRESENT | State::CHANGED, 2);
        assert_eq!(event_count(raw), 2);
        assert!(raw.contains(State::PRESENT | State::CHANGED));
        assert_eq!(ReaderStatus::reduce(raw), ReaderStatus::Present);
        assert_eq!(status_bits(raw), State::PRESENT);

        assert_eq!(event_count(with_event_count(State::EMPTY, 0x1_0003)), 3);
    }

    #[test]
    fn test_adopt_keeps_event_count_for_next_wait() {
        let mut snapshot = StatusSnapshot::new(vec!["Reader0".into()]);
        let first = with_event_count(State::PRESENT | State::CHANGED, 1);

        assert_eq!(snapshot.adopt(&[first]), vec![0]);
        assert_eq!(snapshot.current_flags(), vec![first]);
        assert_eq!(event_count(snapshot.current_flags()[0]), 1);

        // Same counter: a spurious change marker
        assert!(snapshot.adopt(&[first]).is_empty());
    }

    #[test]
    fn test_adopt_reports_card_swap() {
        let mut snapshot = StatusSnapshot::new(vec!["Reader0".into()]);
        snapshot.adopt(&[with_event_count(State::PRESENT | State::CHANGED, 1)]);

        // Removed and reinserted between two waits: same flags, counter moved by two
        let swapped = with_event_count(State::PRESENT | State::CHANGED, 3);
        assert_eq!(snapshot.adopt(&[swapped]), vec![0]);
        assert_eq!(event_count(snapshot.entry(0).flags), 3);
    }

    #[test]
    fn test_reconcile_keeps_known_readers() {
        let mut snapshot = StatusSnapshot::new(vec!["Reader0".into(), "Reader1".into()]);
        snapshot.adopt(&[State::PRESENT | State::CHANGED, State::EMPTY | State::CHANGED]);
        snapshot.set_status(0, ReaderStatus::Present);

        snapshot.reconcile(vec!["Reader2".into(), "Reader0".into()]);

        assert_eq!(snapshot.names(), vec!["Reader2", "Reader0"]);
        assert_eq!(snapshot.entry(0).status, ReaderStatus::Unaware);
        assert_eq!(snapshot.get("Reader0").unwrap().status, ReaderStatus::Present);
        assert!(snapshot.get("Reader1").is_none());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ReaderStatus::AtrMatch).unwrap(),
            "\"atr_match\""
        );
        assert_eq!(
            serde_json::from_str::<ReaderStatus>("\"in_use\"").unwrap(),
            ReaderStatus::InUse
        );
    }
}
