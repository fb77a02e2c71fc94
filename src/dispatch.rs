//! In-process fan-out of decoded events to registered handlers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::DispatchError;
use crate::event::BusEvent;

/// A subscriber for one event type.
///
/// A single object may implement `EventHandler` for several event types and
/// be registered once per type.
pub trait EventHandler<E: BusEvent>: Send + Sync + 'static {
    /// Handle one event. An error (or panic) counts as a failed dispatch
    /// attempt for the underlying row.
    fn handle(&self, event: &E) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Identity of one registration, used to unregister it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type AnyEvent = Arc<dyn Any + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&str) -> Result<AnyEvent, serde_json::Error> + Send + Sync>;
type InvokeFn = Arc<dyn Fn(AnyEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct RegisteredHandler {
    id: SubscriberId,
    invoke: InvokeFn,
}

/// Type-indexed handler registry.
///
/// Handlers are indexed by their event's
/// [`EVENT_NAME`](crate::BusEvent::EVENT_NAME) tag. Decoders are registered
/// alongside handlers and kept for the life of the dispatcher, so an event
/// type that once had a handler still decodes (and no-ops) after every
/// handler unregistered.
///
/// Registration and unregistration may interleave with dispatch: the handler
/// set for one dispatch is snapshotted when that dispatch begins.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    decoders: RwLock<HashMap<String, DecodeFn>>,
    handlers: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
}

impl EventDispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    /// Register `handler` for events of type `E`.
    ///
    /// Matching events are delivered to handlers in registration order.
    pub fn register<E, H>(&self, handler: Arc<H>) -> SubscriberId
    where
        E: BusEvent,
        H: EventHandler<E>,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut decoders = write(&self.decoders);
        decoders.entry(E::EVENT_NAME.to_owned()).or_insert_with(|| {
            Arc::new(|event_json| {
                let event: E = serde_json::from_str(event_json)?;
                Ok(Arc::new(event) as AnyEvent)
            })
        });
        drop(decoders);

        let invoke: InvokeFn = Arc::new(move |event: AnyEvent| {
            let handler = Arc::clone(&handler);
            async move {
                let event = event
                    .downcast::<E>()
                    .map_err(|_| anyhow!("event payload is not a `{}`", E::EVENT_NAME))?;
                handler.handle(&event).await
            }
            .boxed()
        });

        write(&self.handlers)
            .entry(E::EVENT_NAME.to_owned())
            .or_default()
            .push(RegisteredHandler { id, invoke });
        id
    }

    /// Remove a registration. Returns whether it was still present.
    ///
    /// Takes effect immediately: a dispatch that begins after this call
    /// returns will not deliver to the removed handler.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut handlers = write(&self.handlers);
        let mut removed = false;
        for registered in handlers.values_mut() {
            let before = registered.len();
            registered.retain(|handler| handler.id != id);
            removed |= registered.len() != before;
        }
        removed
    }

    /// Decode one event and deliver it to every matching handler.
    ///
    /// Handlers run sequentially in registration order; a failing (or
    /// panicking) handler does not short-circuit the rest. If any handler
    /// failed, the returned error carries the first underlying cause. An
    /// event with a known decoder and no matching handler is a successful
    /// no-op.
    pub async fn dispatch(&self, event_name: &str, event_json: &str) -> Result<(), DispatchError> {
        let decoder = read(&self.decoders)
            .get(event_name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownEventType(event_name.to_owned()))?;
        let event = decoder(event_json).map_err(|source| DispatchError::Decode {
            event_name: event_name.to_owned(),
            source,
        })?;

        let invokes: Vec<InvokeFn> = read(&self.handlers)
            .get(event_name)
            .map(|registered| {
                registered
                    .iter()
                    .map(|handler| Arc::clone(&handler.invoke))
                    .collect()
            })
            .unwrap_or_default();

        let mut first_failure = None;
        let mut failed = 0usize;
        for invoke in invokes {
            let outcome = match AssertUnwindSafe(invoke(Arc::clone(&event)))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
            };
            if let Err(error) = outcome {
                failed += 1;
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(source) => Err(DispatchError::Handler {
                event_name: event_name.to_owned(),
                failed,
                source,
            }),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ticked {
        tick: u64,
    }

    impl BusEvent for Ticked {
        const EVENT_NAME: &'static str = "test:ticked";

        fn user_token(&self) -> Uuid {
            Uuid::nil()
        }

        fn search_key1(&self) -> i64 {
            0
        }

        fn search_key2(&self) -> i64 {
            0
        }
    }

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl EventHandler<Ticked> for Recorder {
        async fn handle(&self, _event: &Ticked) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(self.label);
            if self.fail {
                anyhow::bail!("{} failed", self.label);
            }
            Ok(())
        }
    }

    fn recorder(
        label: &'static str,
        seen: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            seen: Arc::clone(seen),
            fail,
        })
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register::<Ticked, _>(recorder("first", &seen, false));
        dispatcher.register::<Ticked, _>(recorder("second", &seen, false));

        assert_ok!(dispatcher.dispatch("test:ticked", r#"{"tick":1}"#).await);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_short_circuit_the_rest() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register::<Ticked, _>(recorder("first", &seen, true));
        dispatcher.register::<Ticked, _>(recorder("second", &seen, true));
        dispatcher.register::<Ticked, _>(recorder("third", &seen, false));

        let error = dispatcher
            .dispatch("test:ticked", r#"{"tick":1}"#)
            .await
            .unwrap_err();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);

        // The surfaced cause is the first failure.
        match error {
            DispatchError::Handler { failed, source, .. } => {
                assert_eq!(failed, 2);
                assert_eq!(source.to_string(), "first failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn a_panicking_handler_is_isolated() {
        struct Panicker;

        impl EventHandler<Ticked> for Panicker {
            async fn handle(&self, _event: &Ticked) -> anyhow::Result<()> {
                panic!("boom");
            }
        }

        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register::<Ticked, _>(Arc::new(Panicker));
        dispatcher.register::<Ticked, _>(recorder("survivor", &seen, false));

        let error = dispatcher
            .dispatch("test:ticked", r#"{"tick":1}"#)
            .await
            .unwrap_err();
        assert_eq!(*seen.lock().unwrap(), vec!["survivor"]);
        match error {
            DispatchError::Handler { source, .. } => {
                assert_eq!(source.to_string(), "handler panicked: boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unregistration_is_immediate() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = dispatcher.register::<Ticked, _>(recorder("first", &seen, false));
        dispatcher.register::<Ticked, _>(recorder("second", &seen, false));

        assert!(dispatcher.unregister(first));
        assert!(!dispatcher.unregister(first));

        assert_ok!(dispatcher.dispatch("test:ticked", r#"{"tick":1}"#).await);
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn no_matching_handler_is_a_successful_noop() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let only = dispatcher.register::<Ticked, _>(recorder("only", &seen, false));
        assert!(dispatcher.unregister(only));

        // The decoder registered alongside the handler outlives it.
        assert_ok!(dispatcher.dispatch("test:ticked", r#"{"tick":1}"#).await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_an_error() {
        let dispatcher = EventDispatcher::new();
        let error = dispatcher.dispatch("test:unknown", "{}").await.unwrap_err();
        assert!(matches!(error, DispatchError::UnknownEventType(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register::<Ticked, _>(recorder("only", &seen, false));

        let error = dispatcher
            .dispatch("test:ticked", r#"{"tick":"not a number"}"#)
            .await
            .unwrap_err();
        assert!(matches!(error, DispatchError::Decode { .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_object_can_subscribe_to_several_types() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Tocked;

        impl BusEvent for Tocked {
            const EVENT_NAME: &'static str = "test:tocked";

            fn user_token(&self) -> Uuid {
                Uuid::nil()
            }

            fn search_key1(&self) -> i64 {
                0
            }

            fn search_key2(&self) -> i64 {
                0
            }
        }

        #[derive(Default)]
        struct Both {
            ticks: Mutex<u64>,
            tocks: Mutex<u64>,
        }

        impl EventHandler<Ticked> for Both {
            async fn handle(&self, event: &Ticked) -> anyhow::Result<()> {
                *self.ticks.lock().unwrap() += event.tick;
                Ok(())
            }
        }

        impl EventHandler<Tocked> for Both {
            async fn handle(&self, _event: &Tocked) -> anyhow::Result<()> {
                *self.tocks.lock().unwrap() += 1;
                Ok(())
            }
        }

        let dispatcher = EventDispatcher::new();
        let both = Arc::new(Both::default());
        dispatcher.register::<Ticked, _>(Arc::clone(&both));
        dispatcher.register::<Tocked, _>(Arc::clone(&both));

        assert_ok!(dispatcher.dispatch("test:ticked", r#"{"tick":3}"#).await);
        assert_ok!(dispatcher.dispatch("test:tocked", "null").await);
        assert_eq!(*both.ticks.lock().unwrap(), 3);
        assert_eq!(*both.tocks.lock().unwrap(), 1);
    }
}
