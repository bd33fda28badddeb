mod base;

pub use base::{
    BroadcastEventBus, CollectingEventBus, EventBus, FlowcraftEvent, NullEventBus, TeeEventBus,
};
