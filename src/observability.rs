use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("gemchat.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("gemchat.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("gemchat.client.request_duration_seconds");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("gemchat.stream.events");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("gemchat.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("gemchat.stream.bytes");

pub(crate) static CONVERSATION_SENDS: Counter = Counter::new("gemchat.conversation.sends");
pub(crate) static CONVERSATION_SENDS_IGNORED: Counter =
    Counter::new("gemchat.conversation.sends_ignored");
pub(crate) static CONVERSATION_FRAGMENTS: Counter =
    Counter::new("gemchat.conversation.fragments");
pub(crate) static CONVERSATION_FAILURES: Counter = Counter::new("gemchat.conversation.failures");
pub(crate) static CONVERSATION_TURN_DURATION: Moments =
    Moments::new("gemchat.conversation.turn_duration_seconds");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);

    collector.register_counter(&CONVERSATION_SENDS);
    collector.register_counter(&CONVERSATION_SENDS_IGNORED);
    collector.register_counter(&CONVERSATION_FRAGMENTS);
    collector.register_counter(&CONVERSATION_FAILURES);
    collector.register_moments(&CONVERSATION_TURN_DURATION);
}
