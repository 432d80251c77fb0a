// Typed event registries for both endpoints.
//
// Event names are case-insensitive. The client registry maps a name to the
// decode/encode pair built from the concrete argument type at subscribe
// time plus the list of handlers; the server registry only needs the
// decode half, to deserialize the client's echoed response when an event
// was raised synchronously.

use crate::error::PipeError;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type EventArgs = Box<dyn Any + Send>;

type DecodeFn = dyn Fn(Option<&str>) -> Result<EventArgs, PipeError> + Send + Sync;
type EncodeFn = dyn Fn(&(dyn Any + Send)) -> Result<String, PipeError> + Send + Sync;
type HandlerFn = dyn FnMut(&mut (dyn Any + Send)) + Send;

/// Token identifying one subscribed handler, returned by `subscribe` and
/// consumed by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

struct HandlerSlot {
    id: u64,
    call: Arc<Mutex<Box<HandlerFn>>>,
}

struct RegisteredEvent {
    synchronous: bool,
    decode: Arc<DecodeFn>,
    encode: Arc<EncodeFn>,
    handlers: Vec<HandlerSlot>,
}

/// Result of dispatching an inbound event to the subscribed handlers.
pub struct EventDispatch {
    pub synchronous: bool,
    /// The re-encoded, possibly handler-mutated argument payload; present
    /// only for synchronous events.
    pub response: Option<String>,
}

#[derive(Default)]
pub struct EventRegistry {
    events: Mutex<HashMap<String, RegisteredEvent>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `name`. Returns the subscription token and whether
    /// this created the event entry (first subscription), in which case the
    /// caller still has to announce the interest to the peer.
    pub fn subscribe<T, F>(&self, name: &str, synchronous: bool, handler: F) -> (Subscription, bool)
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
        F: FnMut(&mut T) + Send + 'static,
    {
        let key = name.to_ascii_lowercase();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handler = handler;
        let wrapped: Box<HandlerFn> = Box::new(move |args: &mut (dyn Any + Send)| {
            if let Some(typed) = args.downcast_mut::<T>() {
                handler(typed);
            }
        });
        let slot = HandlerSlot { id, call: Arc::new(Mutex::new(wrapped)) };

        let mut events = lock(&self.events);
        match events.get_mut(&key) {
            Some(event) => {
                event.handlers.push(slot);
                (Subscription(id), false)
            }
            None => {
                events.insert(
                    key,
                    RegisteredEvent {
                        synchronous,
                        decode: make_decode::<T>(),
                        encode: make_encode::<T>(name),
                        handlers: vec![slot],
                    },
                );
                (Subscription(id), true)
            }
        }
    }

    /// Remove the handler behind `subscription` from whichever event owns
    /// it; the event entry is deleted once its handler list is empty.
    /// Returns false if no event owns the handler.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut events = lock(&self.events);
        let owner = events.iter().find_map(|(key, event)| {
            event.handlers.iter().any(|h| h.id == subscription.0).then(|| key.clone())
        });
        let Some(key) = owner else { return false };
        if let Some(event) = events.get_mut(&key) {
            event.handlers.retain(|h| h.id != subscription.0);
            if event.handlers.is_empty() {
                debug!("[EVENTS] removing event \"{}\" after last unsubscribe", key);
                events.remove(&key);
            }
        }
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.events).contains_key(&name.to_ascii_lowercase())
    }

    /// Decode the payload and invoke every handler in subscription order.
    /// A panicking handler is isolated so the rest still run. Returns None
    /// when no event is registered under `name`.
    pub fn dispatch(&self, name: &str, payload: Option<&str>) -> Option<EventDispatch> {
        let key = name.to_ascii_lowercase();
        let (synchronous, decode, encode, handlers) = {
            let events = lock(&self.events);
            let event = events.get(&key)?;
            (
                event.synchronous,
                event.decode.clone(),
                event.encode.clone(),
                event.handlers.iter().map(|h| h.call.clone()).collect::<Vec<_>>(),
            )
        };

        let mut args = match decode(payload) {
            Ok(args) => args,
            Err(err) => {
                warn!("[EVENTS] dropping event \"{}\": {}", key, err);
                return None;
            }
        };

        for call in handlers {
            let invoked = catch_unwind(AssertUnwindSafe(|| {
                let mut handler = lock(&call);
                (*handler)(args.as_mut());
            }));
            if invoked.is_err() {
                warn!("[EVENTS] handler for \"{}\" panicked; continuing", key);
            }
        }

        if !synchronous {
            return Some(EventDispatch { synchronous: false, response: None });
        }
        match encode(args.as_ref()) {
            Ok(response) => Some(EventDispatch { synchronous: true, response: Some(response) }),
            Err(err) => {
                warn!("[EVENTS] response for \"{}\" not encodable: {}", key, err);
                Some(EventDispatch { synchronous: true, response: None })
            }
        }
    }
}

/// Server-side registry: event name to the argument shape used to decode
/// the client's echoed response.
#[derive(Default)]
pub struct ShapeRegistry {
    shapes: Mutex<HashMap<String, Arc<DecodeFn>>>,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&self, name: &str)
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        lock(&self.shapes).insert(name.to_ascii_lowercase(), make_decode::<T>());
    }

    pub fn decode(&self, name: &str, payload: &str) -> Option<Result<EventArgs, PipeError>> {
        let decode = lock(&self.shapes).get(&name.to_ascii_lowercase()).cloned()?;
        Some(decode(Some(payload)))
    }
}

fn make_decode<T>() -> Arc<DecodeFn>
where
    T: DeserializeOwned + Default + Send + 'static,
{
    Arc::new(|payload: Option<&str>| match payload {
        Some(text) if !text.is_empty() => {
            Ok(Box::new(serde_json::from_str::<T>(text)?) as EventArgs)
        }
        _ => Ok(Box::new(T::default()) as EventArgs),
    })
}

fn make_encode<T>(name: &str) -> Arc<EncodeFn>
where
    T: Serialize + Send + 'static,
{
    let name = name.to_string();
    Arc::new(move |args: &(dyn Any + Send)| {
        let typed = args
            .downcast_ref::<T>()
            .ok_or_else(|| PipeError::ShapeMismatch(name.clone()))?;
        Ok(serde_json::to_string(typed)?)
    })
}

// Handler mutexes can be poisoned by a panicking handler; dispatch must
// keep working afterwards.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct PingArgs {
        value: i32,
    }

    #[test]
    fn test_first_subscribe_creates_then_appends() {
        let registry = EventRegistry::new();
        let (_first, created) = registry.subscribe::<PingArgs, _>("Ping", false, |_| {});
        assert!(created);
        let (_second, created) = registry.subscribe::<PingArgs, _>("ping", false, |_| {});
        assert!(!created);
        assert!(registry.contains("PING"));
    }

    #[test]
    fn test_unsubscribe_removes_empty_event() {
        let registry = EventRegistry::new();
        let (first, _) = registry.subscribe::<PingArgs, _>("ping", false, |_| {});
        let (second, _) = registry.subscribe::<PingArgs, _>("ping", false, |_| {});
        assert!(registry.unsubscribe(first));
        assert!(registry.contains("ping"));
        assert!(registry.unsubscribe(second));
        assert!(!registry.contains("ping"));
        assert!(!registry.unsubscribe(second));
    }

    #[test]
    fn test_dispatch_runs_handlers_in_subscription_order() {
        let registry = EventRegistry::new();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        registry.subscribe::<PingArgs, _>("ping", false, move |_| a.lock().unwrap().push("a"));
        let b = seen.clone();
        registry.subscribe::<PingArgs, _>("ping", false, move |_| b.lock().unwrap().push("b"));
        let dispatch = registry.dispatch("ping", Some(r#"{"value":1}"#)).unwrap();
        assert!(!dispatch.synchronous);
        assert_eq!(dispatch.response, None);
        assert_eq!(seen.lock().unwrap().as_slice(), ["a", "b"]);
    }

    #[test]
    fn test_dispatch_unknown_event_is_none() {
        let registry = EventRegistry::new();
        assert!(registry.dispatch("nobody", None).is_none());
    }

    #[test]
    fn test_dispatch_missing_payload_uses_default_args() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        registry.subscribe::<PingArgs, _>("ping", false, move |args| {
            *sink.lock().unwrap() = Some(args.clone());
        });
        registry.dispatch("ping", None).unwrap();
        assert_eq!(seen.lock().unwrap().clone(), Some(PingArgs::default()));
    }

    #[test]
    fn test_panicking_handler_does_not_starve_the_rest() {
        let registry = EventRegistry::new();
        registry.subscribe::<PingArgs, _>("ping", false, |_| panic!("first handler"));
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        registry.subscribe::<PingArgs, _>("ping", false, move |args| {
            *sink.lock().unwrap() = args.value;
        });
        registry.dispatch("ping", Some(r#"{"value":7}"#)).unwrap();
        assert_eq!(*seen.lock().unwrap(), 7);
        // A second dispatch still reaches the surviving handler.
        registry.dispatch("ping", Some(r#"{"value":9}"#)).unwrap();
        assert_eq!(*seen.lock().unwrap(), 9);
    }

    #[test]
    fn test_synchronous_dispatch_returns_mutated_args() {
        let registry = EventRegistry::new();
        registry.subscribe::<PingArgs, _>("ping", true, |args| args.value += 1);
        let dispatch = registry.dispatch("ping", Some(r#"{"value":41}"#)).unwrap();
        assert!(dispatch.synchronous);
        let echoed: PingArgs = serde_json::from_str(dispatch.response.as_deref().unwrap()).unwrap();
        assert_eq!(echoed, PingArgs { value: 42 });
    }

    #[test]
    fn test_shape_registry_decodes_registered_payloads() {
        let shapes = ShapeRegistry::new();
        shapes.register::<PingArgs>("Ping");
        let decoded = shapes.decode("PING", r#"{"value":5}"#).unwrap().unwrap();
        assert_eq!(decoded.downcast_ref::<PingArgs>(), Some(&PingArgs { value: 5 }));
        assert!(shapes.decode("other", "{}").is_none());
        assert!(shapes.decode("ping", "not json").unwrap().is_err());
    }
}
