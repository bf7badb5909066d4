//! Wait-for-condition engine
//!
//! Polls a refresh function until the watched attribute reaches the target
//! value. The wait sleeps for `delay`, then checks at a fixed cadence of
//! `min_timeout` until `timeout` has elapsed. Refresh errors abort the wait.

use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::debug;

use metal_common::{Error, Result, WaitSpec};

/// One refresh result: the observed value and the current attribute value
#[derive(Debug, Clone)]
pub struct Observation<T> {
    pub value: T,
    /// Current value of the watched attribute, `None` if not reported yet
    pub state: Option<String>,
}

impl<T> Observation<T> {
    pub fn new(value: T, state: Option<String>) -> Self {
        Self { value, state }
    }
}

/// Bounded poller for a single condition
#[derive(Debug, Clone)]
pub struct ConditionPoller {
    spec: WaitSpec,
}

impl ConditionPoller {
    pub fn new(spec: WaitSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &WaitSpec {
        &self.spec
    }

    /// Poll `refresh` until the target is observed
    ///
    /// `resource` names the watched resource in the timeout error.
    pub async fn wait<T, F, Fut>(&self, resource: &str, mut refresh: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>>>,
    {
        let spec = &self.spec;
        let start = Instant::now();
        let interval = spec.poll_interval();

        sleep(spec.delay.min(spec.timeout)).await;

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let observation = refresh().await?;

            if observation.state.as_deref() == Some(spec.target.as_str()) {
                debug!(
                    resource = resource,
                    attempts = attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "{} reached {}",
                    spec.attribute,
                    spec.target
                );
                return Ok(observation.value);
            }

            let elapsed = start.elapsed();
            debug!(
                resource = resource,
                attempts = attempts,
                observed = ?observation.state,
                "Waiting for {} to become {}",
                spec.attribute,
                spec.target
            );

            if elapsed >= spec.timeout {
                return Err(Error::Timeout {
                    key: resource.to_string(),
                    attribute: spec.attribute.clone(),
                    target: spec.target.clone(),
                    last_observed: observation.state,
                    elapsed,
                });
            }

            sleep(interval.min(spec.timeout - elapsed)).await;
        }
    }
}
