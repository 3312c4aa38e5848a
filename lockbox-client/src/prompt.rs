//! Client side of `org.freedesktop.Secret.Prompt`.
//!
//! A method that needs user consent returns a prompt path instead of a
//! result.  [`Prompt::perform`] calls `Prompt()` on it and waits for the
//! `Completed` signal, watching for the service leaving the bus and for the
//! caller cancelling.
//!
//! States: `Idle -> Prompting -> Completed | Dismissed | Vanished`.  The
//! controller subscribes to `Completed` and to the bus-name watch before
//! calling `Prompt()` so neither event can be missed.  Cancellation sends
//! exactly one `Dismiss()` and keeps waiting for the service's answer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use lockbox_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{PromptEvent, PromptResult, SecretTransport, Serial};

/// Result type the caller expects the prompt to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedResult {
    Any,
    ObjectPath,
    ObjectPaths,
    String,
}

impl ExpectedResult {
    pub fn accepts(self, result: &PromptResult) -> bool {
        matches!(
            (self, result),
            (Self::Any, _)
                | (Self::ObjectPath, PromptResult::ObjectPath(_))
                | (Self::ObjectPaths, PromptResult::ObjectPaths(_))
                | (Self::String, PromptResult::String(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    Idle,
    Prompting,
    Completed,
    Dismissed,
    Vanished,
}

impl PromptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dismissed | Self::Vanished)
    }
}

/// How a prompt resolved.  `result` is `None` when the user declined, the
/// service vanished, or the service sent something unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub result: Option<PromptResult>,
    pub serial: Serial,
}

impl PromptOutcome {
    fn declined() -> Self {
        Self {
            result: None,
            serial: Serial::LOCAL,
        }
    }

    pub fn is_dismissed(&self) -> bool {
        self.result.is_none()
    }

    pub fn into_path(self) -> Option<String> {
        match self.result {
            Some(PromptResult::ObjectPath(p)) => Some(p),
            _ => None,
        }
    }

    pub fn into_paths(self) -> Option<Vec<String>> {
        match self.result {
            Some(PromptResult::ObjectPaths(p)) => Some(p),
            _ => None,
        }
    }
}

/// A remote prompt, driven at most once.
pub struct Prompt {
    path: String,
    used: AtomicBool,
    state: Mutex<PromptState>,
}

impl Prompt {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            used: AtomicBool::new(false),
            state: Mutex::new(PromptState::Idle),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> PromptState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to a terminal state.  Returns `false` if one was already reached.
    fn finish(&self, next: PromptState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return false;
        }
        debug!(prompt = %self.path, from = ?*state, to = ?next, "prompt finished");
        *state = next;
        true
    }

    /// Show the prompt and wait for it to resolve.
    pub async fn perform(
        &self,
        transport: &dyn SecretTransport,
        window_id: &str,
        expected: ExpectedResult,
        cancel: Option<&CancellationToken>,
    ) -> Result<PromptOutcome> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(Error::PromptReentered(self.path.clone()));
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = PromptState::Prompting;

        let outcome = self.drive(transport, window_id, expected, cancel).await;
        if outcome.is_err() {
            self.finish(PromptState::Dismissed);
        }
        debug!(prompt = %self.path, "prompt teardown");
        outcome
    }

    async fn drive(
        &self,
        transport: &dyn SecretTransport,
        window_id: &str,
        expected: ExpectedResult,
        cancel: Option<&CancellationToken>,
    ) -> Result<PromptOutcome> {
        let mut completions = transport.prompt_completions(&self.path).await?;
        let mut vanished = transport.owner_vanished().await?;

        let call = transport.prompt(&self.path, window_id);
        tokio::pin!(call);
        let mut call_done = false;
        let mut dismiss_sent = false;

        debug!(prompt = %self.path, "prompting");
        loop {
            tokio::select! {
                biased;

                event = completions.next() => {
                    match event {
                        Some(PromptEvent::Completed { dismissed: true, .. }) => {
                            self.finish(PromptState::Dismissed);
                            info!(prompt = %self.path, "prompt dismissed");
                            return Ok(PromptOutcome::declined());
                        }
                        Some(PromptEvent::Completed { dismissed: false, result, serial }) => {
                            self.finish(PromptState::Completed);
                            if !expected.accepts(&result) {
                                warn!(
                                    prompt = %self.path,
                                    expected = ?expected,
                                    got = ?result,
                                    "prompt result has unexpected type"
                                );
                                return Ok(PromptOutcome { result: None, serial });
                            }
                            return Ok(PromptOutcome { result: Some(result), serial });
                        }
                        Some(PromptEvent::Malformed(why)) => {
                            warn!(prompt = %self.path, error = %why, "malformed Completed signal");
                            self.finish(PromptState::Dismissed);
                            return Ok(PromptOutcome::declined());
                        }
                        None => {
                            warn!(prompt = %self.path, "Completed stream ended");
                            self.finish(PromptState::Vanished);
                            return Ok(PromptOutcome::declined());
                        }
                    }
                }

                _ = vanished.next() => {
                    info!(prompt = %self.path, "service left the bus while prompting");
                    self.finish(PromptState::Vanished);
                    return Ok(PromptOutcome::declined());
                }

                res = &mut call, if !call_done => {
                    call_done = true;
                    if let Err(e) = res {
                        warn!(prompt = %self.path, error = %e, "Prompt() failed");
                        return Err(e);
                    }
                }

                _ = cancelled(cancel), if !dismiss_sent => {
                    dismiss_sent = true;
                    debug!(prompt = %self.path, "cancelled, dismissing prompt");
                    if let Err(e) = transport.dismiss(&self.path).await {
                        warn!(prompt = %self.path, error = %e, "Dismiss() failed");
                        self.finish(PromptState::Dismissed);
                        return Ok(PromptOutcome::declined());
                    }
                }
            }
        }
    }
}

/// Resolves when `token` is cancelled; never resolves without a token.
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockService, PromptPolicy};
    use std::time::Duration;

    async fn pending_unlock(mock: &MockService) -> String {
        let collection = mock.add_collection("login", "Login", true);
        mock.require_prompt_for_unlock(true);
        let reply = mock.unlock(&[collection]).await.unwrap().value;
        assert!(reply.objects.is_empty());
        reply.prompt
    }

    #[test]
    fn expected_result_checks() {
        let paths = PromptResult::ObjectPaths(vec!["/a".into()]);
        assert!(ExpectedResult::ObjectPaths.accepts(&paths));
        assert!(ExpectedResult::Any.accepts(&paths));
        assert!(!ExpectedResult::ObjectPath.accepts(&paths));
        assert!(!ExpectedResult::String.accepts(&PromptResult::Other("u".into())));
    }

    #[tokio::test]
    async fn completes_with_typed_result() {
        let mock = MockService::new();
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);

        let outcome = prompt
            .perform(mock.as_ref(), "", ExpectedResult::ObjectPaths, None)
            .await
            .unwrap();

        assert_eq!(prompt.state(), PromptState::Completed);
        let paths = outcome.into_paths().unwrap();
        assert_eq!(paths, vec!["/org/freedesktop/secrets/collection/login"]);
        assert_eq!(mock.counters().prompt(), 1);
    }

    #[tokio::test]
    async fn dismissed_by_user_yields_no_result() {
        let mock = MockService::new();
        mock.set_prompt_policy(PromptPolicy::Dismiss);
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);

        let outcome = prompt
            .perform(mock.as_ref(), "", ExpectedResult::ObjectPaths, None)
            .await
            .unwrap();

        assert!(outcome.is_dismissed());
        assert_eq!(prompt.state(), PromptState::Dismissed);
    }

    #[tokio::test]
    async fn type_mismatch_is_no_result() {
        let mock = MockService::new();
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);

        let outcome = prompt
            .perform(mock.as_ref(), "", ExpectedResult::String, None)
            .await
            .unwrap();

        assert!(outcome.result.is_none());
        assert_eq!(prompt.state(), PromptState::Completed);
    }

    #[tokio::test]
    async fn malformed_signal_is_no_result() {
        let mock = MockService::new();
        mock.set_prompt_policy(PromptPolicy::Malformed);
        let path = pending_unlock(&mock).await;

        let outcome = Prompt::new(&path)
            .perform(mock.as_ref(), "", ExpectedResult::Any, None)
            .await
            .unwrap();
        assert!(outcome.is_dismissed());
    }

    #[tokio::test]
    async fn reentry_is_rejected() {
        let mock = MockService::new();
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);

        prompt
            .perform(mock.as_ref(), "", ExpectedResult::Any, None)
            .await
            .unwrap();
        let again = prompt
            .perform(mock.as_ref(), "", ExpectedResult::Any, None)
            .await;
        assert!(matches!(again, Err(Error::PromptReentered(p)) if p == path));
        assert_eq!(mock.counters().prompt(), 1);
    }

    #[tokio::test]
    async fn vanish_resolves_as_dismissed() {
        let mock = MockService::new();
        mock.set_prompt_policy(PromptPolicy::Hold);
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);

        let vanisher = {
            let mock = std::sync::Arc::clone(&mock);
            async move {
                mock.wait_for_prompt_calls(1).await;
                mock.vanish();
            }
        };
        let (outcome, ()) = tokio::join!(
            prompt.perform(mock.as_ref(), "", ExpectedResult::Any, None),
            vanisher
        );

        assert!(outcome.unwrap().is_dismissed());
        assert_eq!(prompt.state(), PromptState::Vanished);
        assert_eq!(mock.counters().dismiss(), 0);
    }

    #[tokio::test]
    async fn cancel_sends_one_dismiss_and_resolves_once() {
        let mock = MockService::new();
        mock.set_prompt_policy(PromptPolicy::Hold);
        // The dismissal signal and a bus-name vanish both arrive.
        mock.vanish_on_dismiss(true);
        let path = pending_unlock(&mock).await;
        let prompt = Prompt::new(&path);
        let token = CancellationToken::new();

        let canceller = {
            let mock = std::sync::Arc::clone(&mock);
            let token = token.clone();
            async move {
                mock.wait_for_prompt_calls(1).await;
                token.cancel();
            }
        };
        let (outcome, ()) = tokio::join!(
            prompt.perform(mock.as_ref(), "", ExpectedResult::Any, Some(&token)),
            canceller
        );

        assert!(outcome.unwrap().is_dismissed());
        assert!(prompt.state().is_terminal());
        assert_eq!(mock.counters().dismiss(), 1);

        // Nothing further happens once resolved.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.counters().dismiss(), 1);
    }
}
