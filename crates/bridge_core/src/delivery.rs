//! Bounded retry around outbound sends and uploads.
//!
//! Only gateway failures (502/504) are retried, after a fixed sleep. Every
//! other failure is handed straight back so the caller can post a notice.

use std::{future::Future, time::Duration};

use shared::error::{FailureClass, RequestError};
use tracing::warn;

use crate::{error::DeliveryError, settings::RetrySettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub gateway_delay: Duration,
}

impl RetryPolicy {
    pub fn for_send(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.send_attempts.max(1),
            gateway_delay: settings.gateway_delay(),
        }
    }

    pub fn for_upload(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.upload_attempts.max(1),
            gateway_delay: settings.gateway_delay(),
        }
    }
}

pub fn classify(err: &anyhow::Error) -> FailureClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RequestError>())
        .map(RequestError::class)
        .unwrap_or(FailureClass::Other)
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt_once: F,
) -> Result<T, DeliveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match attempt_once().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match classify(&err) {
            FailureClass::Transient if attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = policy.gateway_delay.as_millis() as u64,
                    "delivery: gateway error, retrying: {err}"
                );
                tokio::time::sleep(policy.gateway_delay).await;
            }
            FailureClass::Transient => {
                return Err(DeliveryError::Exhausted {
                    operation,
                    attempts: attempt,
                    source: err,
                })
            }
            FailureClass::Permanent => {
                return Err(DeliveryError::Permanent {
                    operation,
                    source: err,
                })
            }
            FailureClass::Other => {
                return Err(DeliveryError::Failed {
                    operation,
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
