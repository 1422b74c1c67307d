use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Start(usize),
    End(usize),
}

/// Records task start and end events against a single logical clock, so
/// "A ended before B started" can be checked across threads.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    clock: AtomicU64,
    events: Mutex<Vec<(u64, Event)>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        // Tick under the lock so the log is sorted by timestamp.
        let mut events = self.events.lock();
        let ts = self.clock.fetch_add(1, Ordering::AcqRel);
        events.push((ts, event));
    }

    pub(crate) fn start(&self, task: usize) {
        self.push(Event::Start(task));
    }

    pub(crate) fn end(&self, task: usize) {
        self.push(Event::End(task));
    }

    fn timestamp(&self, event: Event) -> Option<u64> {
        self.events
            .lock()
            .iter()
            .find(|(_, e)| *e == event)
            .map(|(ts, _)| *ts)
    }

    /// True if `before` ended before `after` started.
    #[track_caller]
    pub(crate) fn precedes(&self, before: usize, after: usize) -> bool {
        match (
            self.timestamp(Event::End(before)),
            self.timestamp(Event::Start(after)),
        ) {
            (Some(end), Some(start)) => end < start,
            (end, start) => panic!("missing events: end of {before} {end:?}, start of {after} {start:?}"),
        }
    }

    pub(crate) fn start_order(&self) -> Vec<usize> {
        self.events
            .lock()
            .iter()
            .filter_map(|(_, e)| match e {
                Event::Start(task) => Some(*task),
                Event::End(_) => None,
            })
            .collect()
    }

    pub(crate) fn started(&self) -> usize {
        self.start_order().len()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().iter().map(|(_, e)| *e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_orders_events() {
        let rec = Recorder::new();
        rec.start(0);
        rec.end(0);
        rec.start(1);
        rec.start(2);
        rec.end(2);
        rec.end(1);

        assert!(rec.precedes(0, 1));
        assert!(rec.precedes(0, 2));
        assert!(!rec.precedes(1, 2));
        assert_eq!(rec.start_order(), vec![0, 1, 2]);
        assert_eq!(rec.events().len(), 6);
    }
}
