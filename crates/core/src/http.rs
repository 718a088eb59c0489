//! Plumbing shared by every vendor integration reached over HTTP.

use crate::error::{ProviderError, ProviderFailure};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs a provider call under a deadline, aborting it when the caller cancels.
/// A timeout is reported exactly like any other provider failure.
pub async fn guarded<T, F>(
    provider: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProviderError::new(
            provider,
            ProviderFailure::Cancelled,
            "request cancelled by caller",
        )),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(
                provider,
                ProviderFailure::Timeout,
                format!("no response within {} ms", timeout.as_millis()),
            )),
        },
    }
}

/// Sends a request and decodes a JSON body, turning vendor status codes and
/// error bodies into [`ProviderError`]s that keep the vendor's own message.
pub async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|error| ProviderError::from_reqwest(provider, error))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::new(
            provider,
            ProviderFailure::from_status(status),
            vendor_message(status, &body),
        ));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|error| ProviderError::from_reqwest(provider, error))?;
    serde_json::from_slice(&bytes).map_err(|error| {
        ProviderError::new(
            provider,
            ProviderFailure::MalformedResponse,
            format!("unexpected response body: {error}"),
        )
    })
}

fn vendor_message(status: reqwest::StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let detail = parsed.as_ref().and_then(|value| {
        ["/error/message", "/error", "/detail", "/message"]
            .iter()
            .find_map(|pointer| value.pointer(pointer).and_then(serde_json::Value::as_str))
            .map(str::to_string)
    });
    match detail {
        Some(message) => format!("{status}: {message}"),
        None if body.trim().is_empty() => status.to_string(),
        None => format!("{status}: {}", body.trim().chars().take(300).collect::<String>()),
    }
}
