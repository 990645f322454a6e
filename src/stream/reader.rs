use futures::{Stream, StreamExt};

use super::codec::{LineBuffer, StreamEvent, decode_line};

#[derive(Debug, thiserror::Error)]
pub enum ReadError<E> {
    #[error("stream transport failed: {0}")]
    Transport(#[source] E),
    #[error("stream ended before the end marker")]
    Truncated,
}

/// Counters for one completed stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Events handed to the callback, end marker included.
    pub events: usize,
    /// Malformed lines that were logged and dropped.
    pub skipped: usize,
}

/// Drive one response body to its end marker.
///
/// Events reach `on_event` strictly in arrival order. Anything after the end
/// marker is never read. A body that stops without the marker is reported as
/// [`ReadError::Truncated`].
pub async fn read_events<S, B, E, F>(mut body: S, mut on_event: F) -> Result<ReadSummary, ReadError<E>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    F: FnMut(StreamEvent),
{
    let mut lines = LineBuffer::default();
    let mut summary = ReadSummary::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ReadError::Transport)?;
        for line in lines.push(chunk.as_ref()) {
            if dispatch(&line, &mut summary, &mut on_event) {
                return Ok(summary);
            }
        }
    }

    // EOF terminates the last line even without a newline.
    if let Some(rest) = lines.finish()
        && dispatch(&rest, &mut summary, &mut on_event)
    {
        return Ok(summary);
    }

    Err(ReadError::Truncated)
}

/// Returns true once the end marker has been delivered.
fn dispatch<F: FnMut(StreamEvent)>(line: &str, summary: &mut ReadSummary, on_event: &mut F) -> bool {
    match decode_line(line) {
        Ok(Some(event)) => {
            let done = event.is_done();
            summary.events += 1;
            on_event(event);
            done
        }
        Ok(None) => false,
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed stream line");
            summary.skipped += 1;
            false
        }
    }
}
