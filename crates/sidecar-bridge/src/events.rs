//! Delivery of subprocess events to the host.
//!
//! Events reach the single configured [`EventHandler`] in wire order. In
//! [`EventMode::Typed`] each payload is first offered to a [`Converter`];
//! names the converter does not recognise are delivered raw, so new
//! upstream events never cause a failure.

use std::convert::Infallible;

use sidecar_core::Payload;
use sidecar_core::protocol::EventMessage;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Event payload, converted when a converter recognised it.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData<T> {
    Raw(Payload),
    Typed(T),
}

/// A named event from the subprocess.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub name: String,
    pub data: EventData<T>,
}

/// Event type used when no conversion is configured.
pub type RawEvent = Event<Infallible>;

/// Maps raw event payloads to a richer representation.
pub trait Converter: Send + 'static {
    type Output: Send + 'static;

    /// Convert `data` for event `name`, or hand it back unchanged when the
    /// name (or shape) is not recognised.
    fn convert(&self, name: &str, data: Payload) -> Result<Self::Output, Payload>;
}

/// Converter for raw mode; recognises nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConversion;

impl Converter for NoConversion {
    type Output = Infallible;

    fn convert(&self, _name: &str, data: Payload) -> Result<Infallible, Payload> {
        Err(data)
    }
}

/// Whether payloads are converted, fixed when the connection starts.
#[derive(Debug, Clone)]
pub enum EventMode<C> {
    Raw,
    Typed(C),
}

impl EventMode<NoConversion> {
    pub const fn raw() -> Self {
        Self::Raw
    }
}

/// Receives events. Called on the connection's processing loop, so it must
/// not block.
pub trait EventHandler<T>: Send + 'static {
    fn handle(&mut self, event: Event<T>);
}

impl<T: Send + 'static> EventHandler<T> for mpsc::UnboundedSender<Event<T>> {
    fn handle(&mut self, event: Event<T>) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

impl<T: Send + 'static> EventHandler<T> for Box<dyn FnMut(Event<T>) + Send> {
    fn handle(&mut self, event: Event<T>) {
        (*self)(event);
    }
}

/// Applies the event mode and forwards to the handler.
pub struct EventDispatcher<C: Converter, H> {
    mode: EventMode<C>,
    handler: H,
    delivered: u64,
}

impl<C, H> EventDispatcher<C, H>
where
    C: Converter,
    H: EventHandler<C::Output>,
{
    pub const fn new(mode: EventMode<C>, handler: H) -> Self {
        Self {
            mode,
            handler,
            delivered: 0,
        }
    }

    pub fn dispatch(&mut self, message: EventMessage) {
        let EventMessage { event, data } = message;
        let data = match &self.mode {
            EventMode::Raw => EventData::Raw(data),
            EventMode::Typed(converter) => match converter.convert(&event, data) {
                Ok(typed) => EventData::Typed(typed),
                Err(raw) => EventData::Raw(raw),
            },
        };
        self.delivered += 1;
        trace!(event = %event, seq = self.delivered, "Dispatching event");
        self.handler.handle(Event { name: event, data });
    }

    /// Events delivered so far.
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tick {
        n: u64,
    }

    struct TickConverter;

    impl Converter for TickConverter {
        type Output = Tick;

        fn convert(&self, name: &str, data: Payload) -> Result<Tick, Payload> {
            if name != "tick" {
                return Err(data);
            }
            match data.get("n").and_then(Payload::as_u64) {
                Some(n) => Ok(Tick { n }),
                None => Err(data),
            }
        }
    }

    fn message(event: &str, n: u64) -> EventMessage {
        let mut data = std::collections::BTreeMap::new();
        data.insert("n".to_string(), Payload::from(n));
        EventMessage {
            event: event.into(),
            data: Payload::Object(data),
        }
    }

    #[test]
    fn raw_mode_delivers_payload_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawEvent>();
        let mut dispatcher = EventDispatcher::new(EventMode::raw(), tx);

        dispatcher.dispatch(message("tick", 1));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "tick");
        assert!(matches!(event.data, EventData::Raw(ref p) if p.get("n").and_then(Payload::as_u64) == Some(1)));
    }

    #[test]
    fn typed_mode_converts_known_and_passes_unknown() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event<Tick>>();
        let mut dispatcher = EventDispatcher::new(EventMode::Typed(TickConverter), tx);

        dispatcher.dispatch(message("tick", 7));
        dispatcher.dispatch(message("brand.new.event", 8));

        assert_eq!(rx.try_recv().unwrap().data, EventData::Typed(Tick { n: 7 }));
        let unknown = rx.try_recv().unwrap();
        assert_eq!(unknown.name, "brand.new.event");
        assert!(matches!(unknown.data, EventData::Raw(_)));
    }

    #[test]
    fn delivery_keeps_arrival_order() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        let handler: Box<dyn FnMut(RawEvent) + Send> = Box::new(move |event| {
            if let EventData::Raw(data) = event.data {
                sink.lock().unwrap().push(data.get("n").and_then(Payload::as_u64));
            }
        });
        let mut dispatcher = EventDispatcher::new(EventMode::raw(), handler);

        for n in 0..50 {
            dispatcher.dispatch(message("tick", n));
        }
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (0..50).map(Some).collect::<Vec<_>>());
        assert_eq!(dispatcher.delivered(), 50);
    }
}
