//! Events emitted during playback.
//!
//! This module defines the events that can be triggered during a media
//! session. These events can be used to:
//! * Monitor playback state changes
//! * Drive a progress bar from time updates
//! * React to track and error conditions
//!
//! Events are fanned out to any number of subscribers. Dispatch is never
//! re-entrant: a state transition queues its event and delivery happens
//! after the transition completes, so an observer that calls back into
//! the player sees consistent state.
//!
//! # Example
//!
//! ```rust
//! use kinema::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TimeUpdate { position } => println!("at {position:.1}s"),
//!         Event::Ended => println!("End of media"),
//!         // ... handle other events ...
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::Mutex;

use crate::{error::ErrorKind, state::PlayerState, track::Track};

/// Events that can be emitted by the player.
///
/// These events represent significant changes in playback or session
/// status. Payload-carrying variants use named fields so embedders can
/// destructure only what they need.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A new media session has started loading.
    LoadStart,

    /// Media info is available and the session is ready.
    LoadEnd,

    /// Playback has started or resumed.
    Play,

    /// Playback has paused.
    Pause,

    /// Playback reached the end of the media.
    Ended,

    /// The playback position advanced.
    ///
    /// Emitted from the presentation loop, at most once per tick.
    TimeUpdate {
        /// Current media time in seconds.
        position: f64,
    },

    /// The media duration became known or changed.
    DurationChange {
        /// Total duration in seconds.
        duration: f64,
    },

    /// The player state machine transitioned.
    StateChange {
        /// The state entered by the transition.
        state: PlayerState,
    },

    /// A seek began.
    Seeking {
        /// Seek target in seconds.
        target: f64,
    },

    /// A seek resolved and playback continues from the target.
    Seeked {
        /// The target the seek was asked for, in seconds.
        target: f64,
    },

    /// The track list changed (after load or stream discovery).
    TracksChange {
        /// The complete new track list.
        tracks: Vec<Track>,
    },

    /// A different audio track was selected.
    ///
    /// Emitted exactly once per selection change.
    AudioTrackChange {
        /// Id of the newly active audio track.
        id: u32,
    },

    /// A different subtitle track was selected, or subtitles disabled.
    SubtitleTrackChange {
        /// Id of the newly active subtitle track, `None` when disabled.
        id: Option<u32>,
    },

    /// A fatal error reached the player surface.
    Error {
        /// Classification of the failure.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },

    /// The player entered or left a rebuffering period.
    Buffering {
        /// `true` while playback is stalled waiting for data.
        active: bool,
    },
}

/// Fan-out registry for player events.
///
/// Subscribers receive every event sent after their subscription. Send
/// failures mean the receiver was dropped; the dead channel is pruned on
/// the next dispatch rather than treated as an error.
#[derive(Debug, Default)]
pub struct EventBus {
    /// Subscriber channels. Interior mutability so that components
    /// holding a shared reference can emit without a mutable borrow.
    subscribers: Mutex<Vec<tokio::sync::mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    /// Creates an empty bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    ///
    /// Returns the receiving half of an unbounded channel. Dropping the
    /// receiver unsubscribes implicitly.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Sends an event to every live subscriber.
    ///
    /// Channels whose receiver has been dropped are removed. Failures
    /// are logged but never interrupt playback.
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| {
            if let Err(e) = tx.send(event.clone()) {
                trace!("dropping dead event subscriber: {e}");
                return false;
            }
            true
        });
    }

    /// Returns the number of live subscribers.
    ///
    /// Channels are only pruned on dispatch, so this may transiently
    /// count receivers that have already been dropped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }

    /// Returns whether nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Event::Play);

        assert_eq!(a.try_recv().unwrap(), Event::Play);
        assert_eq!(b.try_recv().unwrap(), Event::Play);
    }

    #[test]
    fn dead_subscribers_are_pruned_on_dispatch() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.emit(Event::Pause);
        assert!(bus.is_empty());
    }

    #[test]
    fn payload_events_round_trip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::Seeking { target: 123.45 });
        bus.emit(Event::Buffering { active: true });

        assert_eq!(rx.try_recv().unwrap(), Event::Seeking { target: 123.45 });
        assert_eq!(rx.try_recv().unwrap(), Event::Buffering { active: true });
    }
}
