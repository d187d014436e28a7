use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::breakpoint::BreakPointEvent;

pub type BreakPointEvents = ReceiverStream<BreakPointEvent>;

/// Channel a breakpoint controller listens on. Producers never block: events
/// that do not fit are dropped.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<BreakPointEvent>, BreakPointEvents) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (sender, ReceiverStream::new(receiver))
}
