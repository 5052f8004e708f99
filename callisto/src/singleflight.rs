//! Deduplicates concurrent executions of the same piece of work.
//!
//! When many tasks miss the cache for the same key at the same time, each of them would invoke
//! the (potentially expensive) loader. A [SingleFlight](SingleFlight) group prevents this
//! thundering herd: the first caller for a key becomes the **leader** and actually performs the
//! work, all other callers arriving while the work is in flight become **followers** and simply
//! receive the leader's result.
//!
//! Note the deliberate freshness trade: followers always observe the result of the flight they
//! joined, even if the underlying data changes while they wait. Once a flight has completed, a
//! subsequent call for the same key starts a fresh one.
//!
//! # Examples
//!
//! ```
//! # use callisto::singleflight::SingleFlight;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let flights: SingleFlight<String> = SingleFlight::new();
//!
//! let value = flights
//!     .execute("answer", || async { Ok("42".to_owned()) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, "42");
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::watch;

/// Captures the outcome of a flight as observed by its followers.
///
/// Errors are shared by reference as they cannot be cloned, each follower derives its own
/// error from the shared one.
type FlightOutcome<V> = Result<V, Arc<anyhow::Error>>;

/// The gate followers wait on. It yields **None** while the flight is in progress and the
/// final outcome once the leader has published it.
type FlightGate<V> = watch::Receiver<Option<FlightOutcome<V>>>;

/// The role a caller plays within a flight, decided under the registry lock.
enum Role<V> {
    Leader(watch::Sender<Option<FlightOutcome<V>>>),
    Follower(FlightGate<V>),
}

/// Coalesces concurrent executions of work identified by a string key.
///
/// See the [module docs](crate::singleflight) for details.
pub struct SingleFlight<V> {
    flights: Mutex<HashMap<String, FlightGate<V>>>,
}

impl<V: Clone> SingleFlight<V> {
    /// Creates a new, empty group of flights.
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given work, unless an execution for the same key is already in flight.
    ///
    /// The closure is invoked at most once per flight, no matter how many callers pile up on
    /// the same key. All of them receive the same result: followers obtain a clone of the
    /// leader's value or an error carrying the leader's error message.
    ///
    /// The work itself runs outside of any lock. A leader which is cancelled before it could
    /// publish its outcome is reported as an error to all followers of its flight.
    pub async fn execute<F, Fut>(&self, key: &str, work: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let role = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key) {
                Some(gate) => Role::Follower(gate.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let _ = flights.insert(key.to_owned(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(gate) => self.follow(key, gate).await,
            Role::Leader(gate) => {
                let result = work().await;

                // Publish the outcome before clearing the registration: a caller which joined
                // the flight in the meantime must find the result behind its gate.
                let outcome = match &result {
                    Ok(value) => Ok(value.clone()),
                    Err(error) => Err(Arc::new(anyhow!("{:#}", error))),
                };
                let _ = gate.send(Some(outcome));
                let _ = self.flights.lock().unwrap().remove(key);

                result
            }
        }
    }

    /// Waits for the leader of the given gate to publish its outcome.
    async fn follow(&self, key: &str, mut gate: FlightGate<V>) -> anyhow::Result<V> {
        let outcome = gate
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                anyhow!(
                    "The in-flight call for key {} was abandoned before it produced a result!",
                    key
                )
            })?
            .clone();

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Err(anyhow!(
                "The in-flight call for key {} completed without a result!",
                key
            )),
        }
    }
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use tokio::time::Duration;

    use crate::singleflight::SingleFlight;
    use crate::testing::test_async;

    #[test]
    fn concurrent_callers_share_a_single_execution() {
        test_async(async {
            let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..100 {
                let flights = flights.clone();
                let invocations = invocations.clone();
                handles.push(tokio::spawn(async move {
                    flights
                        .execute("answer", || async {
                            let _ = invocations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("42".to_owned())
                        })
                        .await
                }));
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap(), "42");
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn a_completed_flight_permits_a_fresh_execution() {
        test_async(async {
            let flights: SingleFlight<i32> = SingleFlight::new();
            let invocations = AtomicUsize::new(0);

            for round in 1..=3 {
                let value = flights
                    .execute("answer", || async {
                        let _ = invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    })
                    .await
                    .unwrap();
                assert_eq!(value, 42);
                assert_eq!(invocations.load(Ordering::SeqCst), round);
            }
        });
    }

    #[test]
    fn followers_observe_the_leaders_error() {
        test_async(async {
            let flights: Arc<SingleFlight<i32>> = Arc::new(SingleFlight::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..10 {
                let flights = flights.clone();
                let invocations = invocations.clone();
                handles.push(tokio::spawn(async move {
                    flights
                        .execute("broken", || async {
                            let _ = invocations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(anyhow!("the source is on fire"))
                        })
                        .await
                }));
            }

            for handle in handles {
                let error = handle.await.unwrap().unwrap_err();
                assert_eq!(format!("{}", error).contains("the source is on fire"), true);
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }
}
