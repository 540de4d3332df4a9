//! Named-event publish/subscribe bus.
//!
//! Subscribers are identified by `(event name, handler)` where the handler is
//! any small comparable value chosen by the owner of the bus (usually an enum).
//! Triggering never runs a handler synchronously: each matching subscription
//! gets its own one-shot timer carrying a [`Delivery`]. When the timer fires
//! the owner passes the delivery back to [`EventBus::deliver`], which
//! re-resolves the subscription and applies throttling. A subscription
//! detached in between is silently skipped.

use crate::timer::{TimerHandle, TimerService};
use log::{debug, error};
use std::{fmt, time::Duration};

/// Delay used by [`EventBus::trigger`].
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// Outcome of attaching a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    Created,
    AlreadyExists,
    OutOfMemory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription<H> {
    event: String,
    handler: H,
    throttle: Duration,
    last_fired: Option<Duration>,
}

impl<H> Subscription<H> {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }
}

/// A scheduled invocation, copied from the subscription at trigger time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery<H, A> {
    pub event: String,
    pub handler: H,
    pub throttle: Duration,
    pub arg: A,
}

#[derive(Debug)]
pub struct EventBus<H> {
    subscriptions: Vec<Subscription<H>>,
}

impl<H> Default for EventBus<H> {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }
}

impl<H> EventBus<H>
where
    H: Copy + PartialEq + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, event: &str, handler: H) -> Attach {
        self.attach_throttled(event, handler, Duration::ZERO)
    }

    /// Subscribe `handler` to `event`, delivering at most once per `throttle`.
    /// A zero throttle disables throttling.
    pub fn attach_throttled(&mut self, event: &str, handler: H, throttle: Duration) -> Attach {
        if self.position(event, handler).is_some() {
            return Attach::AlreadyExists;
        }

        if self.subscriptions.try_reserve(1).is_err() {
            error!("out of memory attaching {event} {handler:?}");
            return Attach::OutOfMemory;
        }

        debug!("attach {event} {handler:?} throttle {throttle:?}");
        self.subscriptions.push(Subscription {
            event: event.to_string(),
            handler,
            throttle,
            last_fired: None,
        });

        Attach::Created
    }

    /// Remove the `(event, handler)` subscription. Absent pairs are ignored.
    pub fn detach(&mut self, event: &str, handler: H) {
        if let Some(index) = self.position(event, handler) {
            self.subscriptions.remove(index);
            debug!("detach {event} {handler:?}");
        }
    }

    /// Remove the first subscription using `handler`, whatever its event.
    pub fn remove_handler(&mut self, handler: H) {
        if let Some(index) = self
            .subscriptions
            .iter()
            .position(|s| s.handler == handler)
        {
            let removed = self.subscriptions.remove(index);
            debug!("detach {} {handler:?}", removed.event);
        }
    }

    pub fn is_attached(&self, event: &str, handler: H) -> bool {
        self.position(event, handler).is_some()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription<H>> {
        self.subscriptions.iter()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn trigger<A, Q>(&self, timers: &mut TimerService<Q>, event: &str, arg: A) -> Vec<TimerHandle>
    where
        A: Clone,
        Q: From<Delivery<H, A>>,
    {
        self.trigger_delayed(timers, event, DEFAULT_DELAY, arg)
    }

    /// Schedule one independent delivery per subscriber of `event`.
    pub fn trigger_delayed<A, Q>(
        &self,
        timers: &mut TimerService<Q>,
        event: &str,
        delay: Duration,
        arg: A,
    ) -> Vec<TimerHandle>
    where
        A: Clone,
        Q: From<Delivery<H, A>>,
    {
        self.subscriptions
            .iter()
            .filter(|s| s.event == event)
            .map(|s| {
                debug!("schedule {event} {:?} in {delay:?}", s.handler);
                timers.schedule(
                    delay,
                    Q::from(Delivery {
                        event: s.event.clone(),
                        handler: s.handler,
                        throttle: s.throttle,
                        arg: arg.clone(),
                    }),
                )
            })
            .collect()
    }

    /// Resolve a fired delivery at time `now`.
    ///
    /// Returns the delivery when its handler must run, `None` when the
    /// subscription is gone or the delivery falls inside the throttle window.
    pub fn deliver<A>(&mut self, delivery: Delivery<H, A>, now: Duration) -> Option<Delivery<H, A>> {
        let Some(index) = self.position(&delivery.event, delivery.handler) else {
            debug!("drop {} {:?}: detached", delivery.event, delivery.handler);
            return None;
        };
        let subscription = &mut self.subscriptions[index];

        let due = match subscription.last_fired {
            None => true,
            Some(_) if delivery.throttle.is_zero() => true,
            Some(last) => now.saturating_sub(last) >= delivery.throttle,
        };

        if !due {
            debug!("drop {} {:?}: throttled", delivery.event, delivery.handler);
            return None;
        }

        subscription.last_fired = Some(now);
        Some(delivery)
    }

    fn position(&self, event: &str, handler: H) -> Option<usize> {
        self.subscriptions
            .iter()
            .position(|s| s.event == event && s.handler == handler)
    }
}

impl<H: fmt::Debug> fmt::Display for EventBus<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "subscriptions:")?;
        for s in &self.subscriptions {
            writeln!(f, "    {} {:?}", s.event, s.handler)?;
        }
        Ok(())
    }
}
