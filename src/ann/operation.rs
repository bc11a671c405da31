use std::thread::sleep;
use std::time::{Duration, Instant};

use super::{AnnError, AnnService, Operation};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` waits for as long as the service takes. First-time
    /// deployments can take around half an hour.
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: None,
        }
    }
}

/// Blocks until a long-running operation finishes.
pub struct OperationPoller<'a> {
    service: &'a dyn AnnService,
    options: PollOptions,
}

impl<'a> OperationPoller<'a> {
    pub fn new(service: &'a dyn AnnService, options: PollOptions) -> Self {
        Self { service, options }
    }

    /// Returns the finished operation, or its failure as an error.
    pub fn wait(&self, operation: Operation, what: &str) -> Result<Operation, AnnError> {
        if operation.done {
            return operation.into_result();
        }

        log::info!("waiting for {what} ({})", operation.name);
        let started = Instant::now();
        let mut current = operation;

        loop {
            if let Some(timeout) = self.options.timeout {
                if started.elapsed() >= timeout {
                    return Err(AnnError::Timeout {
                        name: current.name,
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
            }

            sleep(self.options.interval);
            current = self.service.get_operation(&current.name)?;
            log::debug!(
                "{what}: done={} after {}s",
                current.done,
                started.elapsed().as_secs()
            );

            if current.done {
                log::info!("{what} finished after {}s", started.elapsed().as_secs());
                return current.into_result();
            }
        }
    }
}
