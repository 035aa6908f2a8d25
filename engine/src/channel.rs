//! The many-producer, single-consumer channel workers use to report status
//! back to the refresh loop. The consumer only ever drains it
//! non-blockingly, during the drain phase of a refresh iteration.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use taskgraph_uri::Uri;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A worker began executing. `true` is the ordinary case; `false`
    /// means a worker started for a task the scheduler never dispatched
    /// (a protocol violation, most likely a task admitted despite being
    /// satisfied) and should be logged as such.
    Started(bool),
    Done,
    Fail,
    Other(String),
}

#[derive(Clone)]
pub struct MessageSender(Sender<(Uri, Message)>);

impl MessageSender {
    /// Sends are best-effort: a closed receiver (the scheduler has already
    /// torn down its side of the channel) just drops the message.
    pub fn send(&self, uri: Uri, message: Message) {
        let _ = self.0.send((uri, message));
    }
}

pub struct MessageReceiver(Receiver<(Uri, Message)>);

impl MessageReceiver {
    /// Non-blocking drain of a single pending message.
    pub fn try_recv(&self) -> Option<(Uri, Message)> {
        match self.0.try_recv() {
            Ok(entry) => Some(entry),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub fn channel() -> (MessageSender, MessageReceiver) {
    let (tx, rx) = unbounded();
    (MessageSender(tx), MessageReceiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_messages_in_fifo_order() {
        let (tx, rx) = channel();
        let uri = Uri::task("a");
        tx.send(uri.clone(), Message::Started(true));
        tx.send(uri.clone(), Message::Done);
        assert_eq!(rx.try_recv(), Some((uri.clone(), Message::Started(true))));
        assert_eq!(rx.try_recv(), Some((uri, Message::Done)));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn send_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = channel();
        drop(rx);
        tx.send(Uri::task("a"), Message::Fail);
    }
}
