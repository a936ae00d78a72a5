use crate::{ChatOutput, Result, StoryGraphError};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Accumulate a completion into a single string before any parsing.
///
/// For streamed output the boundary between chunks is the cancellation
/// point: a cancelled token stops accumulation before the next chunk is
/// awaited and surfaces `Cancelled`. Already-received text is discarded.
pub async fn accumulate(output: ChatOutput, cancel: Option<&CancellationToken>) -> Result<String> {
    match output {
        ChatOutput::Complete(text) => Ok(text),
        ChatOutput::Streamed(mut stream) => {
            let mut buffer = String::new();
            let mut chunks = 0usize;
            loop {
                let next = match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                return Err(StoryGraphError::Cancelled(
                                    "stream accumulation cancelled".to_string(),
                                ));
                            }
                            chunk = stream.next() => chunk,
                        }
                    }
                    None => stream.next().await,
                };
                match next {
                    Some(chunk) => {
                        buffer.push_str(&chunk?);
                        chunks += 1;
                    }
                    None => break,
                }
            }
            debug!(chunks, bytes = buffer.len(), "stream accumulated");
            Ok(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn accumulates_chunks_in_order() {
        let chunks = vec![Ok("a gleaming ".to_string()), Ok("longsword".to_string())];
        let output = ChatOutput::Streamed(Box::pin(stream::iter(chunks)));
        let text = accumulate(output, None).await.unwrap();
        assert_eq!(text, "a gleaming longsword");
    }

    #[tokio::test]
    async fn complete_passes_through() {
        let output = ChatOutput::Complete("done".to_string());
        assert_eq!(accumulate(output, None).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn mid_stream_error_propagates() {
        let chunks = vec![
            Ok("partial".to_string()),
            Err(StoryGraphError::Transport("reset".to_string())),
        ];
        let output = ChatOutput::Streamed(Box::pin(stream::iter(chunks)));
        assert_err!(accumulate(output, None).await);
    }

    #[tokio::test]
    async fn cancelled_token_stops_accumulation() {
        let token = CancellationToken::new();
        token.cancel();
        let output = ChatOutput::Streamed(Box::pin(stream::pending()));
        let err = accumulate(output, Some(&token)).await.unwrap_err();
        assert!(matches!(err, StoryGraphError::Cancelled(_)));
    }
}
