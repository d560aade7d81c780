//! Per-key single-flight coordination
//!
//! The first caller for a key becomes the leader and does the work; callers
//! arriving while it runs subscribe and receive a clone of the leader's
//! result. If the leader is dropped before finishing (its task panicked or
//! was aborted), its followers see a closed channel and start over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

type Flights<T> = Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>;

pub(crate) struct SingleFlight<T: Clone> {
    flights: Flights<T>,
}

pub(crate) enum Flight<T: Clone> {
    Leader(FlightLeader<T>),
    Follower(broadcast::Receiver<T>),
}

/// Held by whoever does the work. Owns its handle on the flight map so it
/// can be moved into a spawned task. Must be `finish`ed to hand the result
/// to followers; dropping it releases them empty-handed.
pub(crate) struct FlightLeader<T: Clone> {
    flights: Flights<T>,
    key: String,
    sender: broadcast::Sender<T>,
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lead a new flight for `key`, or follow the one already running.
    pub(crate) fn join(&self, key: &str) -> Flight<T> {
        let mut flights = lock(&self.flights);
        if let Some(sender) = flights.get(key) {
            return Flight::Follower(sender.subscribe());
        }
        let (sender, _) = broadcast::channel(1);
        flights.insert(key.to_owned(), sender.clone());
        Flight::Leader(FlightLeader {
            flights: self.flights.clone(),
            key: key.to_owned(),
            sender,
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.flights).len()
    }
}

impl<T: Clone> FlightLeader<T> {
    /// Receiver for this flight's result, for the caller that started it.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Close the flight and deliver `value` to every follower.
    pub(crate) fn finish(self, value: T) {
        self.release();
        // No followers is fine
        let _ = self.sender.send(value);
    }

    /// Remove this flight from the map, leaving a newer flight for the same
    /// key in place.
    fn release(&self) {
        let mut flights = lock(&self.flights);
        if flights
            .get(&self.key)
            .is_some_and(|current| current.same_channel(&self.sender))
        {
            flights.remove(&self.key);
        }
    }
}

impl<T: Clone> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        self.release();
    }
}

// Critical sections never panic, a poisoned map is still consistent
fn lock<T>(flights: &Mutex<T>) -> MutexGuard<'_, T> {
    flights.lock().unwrap_or_else(PoisonError::into_inner)
}
