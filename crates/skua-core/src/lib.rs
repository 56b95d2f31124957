pub mod error;
pub mod event;

pub use error::EventBusError;
pub use event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, EventSubscription,
    PresenceShow, RosterItem, Subscription,
};
