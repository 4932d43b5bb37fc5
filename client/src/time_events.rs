use std::mem;
use std::time::Instant;

/// A collection of actions that are due at specific times.
///
/// It is the caller's responsibility to keep track of actual time passing:
/// [`TimeEvents::next_trigger`] says when to next call
/// [`TimeEvents::pending_actions`]. Adding an action that is already present
/// postpones it to the new trigger.
#[derive(Debug)]
pub struct TimeEvents<A> {
    events: Vec<TimeEvent<A>>,
}

#[derive(Debug)]
struct TimeEvent<A> {
    time: Instant,
    action: A,
}

impl<A> TimeEvents<A>
where
    A: PartialEq,
{
    pub fn add(&mut self, trigger: Instant, action: A) {
        self.events.retain(|event| event.action != action);
        self.events.push(TimeEvent {
            time: trigger,
            action,
        });
        self.events.sort_unstable_by_key(|event| event.time);
    }

    pub fn remove(&mut self, action: &A) {
        self.events.retain(|event| event.action != *action);
    }

    /// Remove and return all actions that are due, given that time has advanced to `now`.
    pub fn pending_actions(&mut self, now: Instant) -> impl Iterator<Item = A> + '_ {
        let split_index = self.events.partition_point(|event| event.time <= now);

        let remaining = self.events.split_off(split_index);
        let due = mem::replace(&mut self.events, remaining);

        due.into_iter().map(|event| event.action)
    }

    /// The time at which the next action becomes due.
    pub fn next_trigger(&self) -> Option<Instant> {
        Some(self.events.first()?.time)
    }
}

impl<A> Default for TimeEvents<A> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn next_trigger_is_always_earliest_action() {
        let mut events = TimeEvents::default();
        let now = Instant::now();

        events.add(now + Duration::from_secs(3), "three");
        events.add(now + Duration::from_secs(1), "one");
        events.add(now + Duration::from_secs(2), "two");

        assert_eq!(events.next_trigger(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn pending_actions_returns_actions_that_are_due() {
        let mut events = TimeEvents::default();
        let now = Instant::now();

        events.add(now + Duration::from_secs(3), "three");
        events.add(now + Duration::from_secs(1), "one");
        events.add(now + Duration::from_secs(4), "four");

        assert_eq!(
            events
                .pending_actions(now + Duration::from_secs(2))
                .collect::<Vec<_>>(),
            vec!["one"]
        );
        assert_eq!(events.next_trigger(), Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn re_adding_postpones_an_action() {
        let mut events = TimeEvents::default();
        let now = Instant::now();

        events.add(now + Duration::from_secs(1), "one");
        events.add(now + Duration::from_secs(3), "one");

        assert_eq!(
            events
                .pending_actions(now + Duration::from_secs(2))
                .count(),
            0
        );
        assert_eq!(
            events
                .pending_actions(now + Duration::from_secs(4))
                .collect::<Vec<_>>(),
            vec!["one"]
        );
    }

    #[test]
    fn removed_actions_never_fire() {
        let mut events = TimeEvents::default();
        let now = Instant::now();

        events.add(now + Duration::from_secs(1), "one");
        events.remove(&"one");

        assert_eq!(events.next_trigger(), None);
        assert_eq!(events.pending_actions(now + Duration::from_secs(2)).count(), 0);
    }
}
