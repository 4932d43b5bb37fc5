use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Instant;

/// Wakes the event loop when the session's next deadline passes.
///
/// Both endpoints ask their protocol core for the earliest pending deadline
/// on every turn and feed the answer into [`Deadline::set`], which keeps at
/// most one timer armed: an unchanged deadline is a no-op, a new one replaces
/// the timer and `None` disarms it. With nothing armed, [`Deadline::poll`]
/// is always pending.
#[derive(Default)]
pub struct Deadline {
    armed: Option<Instant>,
    timer: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl Deadline {
    pub fn set(&mut self, deadline: Option<Instant>) {
        if self.armed == deadline {
            return;
        }

        self.armed = deadline;
        self.timer = deadline.map(|deadline| Box::pin(tokio::time::sleep_until(deadline.into())));
    }

    /// Ready exactly once per armed deadline, once it has passed.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(timer) = self.timer.as_mut() else {
            return Poll::Pending;
        };

        ready!(timer.as_mut().poll(cx));

        // Keep `armed` so repeating an elapsed deadline stays a no-op.
        self.timer = None;

        Poll::Ready(())
    }
}
