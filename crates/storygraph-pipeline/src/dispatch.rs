use std::sync::Arc;
use storygraph_core::{
    accumulate, CallId, CallType, ChatCompletionProvider, ChatOptions, Message, Result,
    RetryConfig,
};
use storygraph_ledger::CallLedger;
use tracing::{debug, warn};

/// The outer call-dispatch boundary: every LLM invocation flows through
/// here so the ledger sees the full lifecycle and retry policy lives in
/// exactly one place.
///
/// Bounded exponential backoff applies only to retryable (transport /
/// rate-limit) errors. Malformed responses fail the call immediately
/// with the raw text attached.
pub struct CallDispatcher {
    provider: Arc<dyn ChatCompletionProvider>,
    ledger: Arc<CallLedger>,
    retry: RetryConfig,
}

impl CallDispatcher {
    pub fn new(
        provider: Arc<dyn ChatCompletionProvider>,
        ledger: Arc<CallLedger>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            ledger,
            retry,
        }
    }

    pub fn ledger(&self) -> &Arc<CallLedger> {
        &self.ledger
    }

    /// Dispatch and return the accumulated response text.
    pub async fn dispatch(
        &self,
        call_type: CallType,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<(CallId, String)> {
        self.dispatch_parsed(call_type, messages, options, |raw| Ok(raw.to_string()))
            .await
    }

    /// Dispatch and parse the response before the ledger entry reaches a
    /// terminal state: a parse failure records the call as `failed` (raw
    /// response in the error), so every request stays reachable from the
    /// ledger. Parse failures are never retried.
    pub async fn dispatch_parsed<T, F>(
        &self,
        call_type: CallType,
        messages: Vec<Message>,
        options: ChatOptions,
        parse: F,
    ) -> Result<(CallId, T)>
    where
        F: Fn(&str) -> Result<T>,
    {
        let prompt = render_prompt(&messages);
        let call_id = self.ledger.begin(call_type, prompt);
        self.ledger.mark_running(call_id)?;

        let mut attempt: u32 = 0;
        let text = loop {
            match self.attempt(&messages, &options).await {
                Ok(text) => break text,
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        call_id = %call_id,
                        attempt,
                        max = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable call failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.ledger.fail(call_id, e.to_string())?;
                    return Err(e);
                }
            }
        };

        match parse(&text) {
            Ok(value) => {
                self.ledger.complete(call_id, text)?;
                debug!(call_id = %call_id, "call completed");
                Ok((call_id, value))
            }
            Err(e) => {
                self.ledger.fail(call_id, e.to_string())?;
                Err(e)
            }
        }
    }

    async fn attempt(&self, messages: &[Message], options: &ChatOptions) -> Result<String> {
        let output = self.provider.complete_chat(messages, options).await?;
        accumulate(output, None).await
    }
}

fn render_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
