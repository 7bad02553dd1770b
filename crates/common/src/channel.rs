//! Single-shot completion channel between a platform callback and the engine
//!
//! Asynchronous control transfers complete inside the platform's event
//! dispatcher. The backend owns a [`CompletionSender`] for the in-flight
//! transfer and fires it from its completion callback; the transfer engine
//! polls the matching [`CompletionReceiver`] between dispatcher turns.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use protocol::Status;
use tracing::debug;

/// Outcome of an asynchronous control transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Raw completion status
    pub status: Status,
    /// Bytes actually transferred
    pub length: u32,
    /// Data stage buffer, handed back to the engine
    ///
    /// For IN requests the first `length` bytes hold what the device sent.
    pub data: Vec<u8>,
}

/// Completing side, owned by the platform while a transfer is in flight
#[derive(Debug)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Deliver the completion
    ///
    /// Consumes the sender, so a transfer completes at most once. Fails only
    /// if the engine already gave up on the transfer.
    pub fn complete(self, completion: Completion) -> crate::Result<()> {
        let status = completion.status;
        self.tx.try_send(completion).map_err(|e| {
            debug!("Completion ({}) dropped, waiter already gone", status);
            crate::Error::Channel(e.to_string())
        })
    }
}

/// Waiting side, owned by the transfer engine
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: Receiver<Completion>,
}

impl CompletionReceiver {
    /// Take the completion if it has arrived (non-blocking)
    ///
    /// Returns an error if the sender was dropped without completing, which
    /// means the platform discarded the transfer.
    pub fn try_take(&self) -> crate::Result<Option<Completion>> {
        match self.rx.try_recv() {
            Ok(completion) => Ok(Some(completion)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(crate::Error::Channel(
                "completion sender dropped".to_string(),
            )),
        }
    }
}

/// Create a completion channel for one transfer
///
/// Returns (sender for the platform, receiver for the engine)
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = bounded(1);
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(length: u32) -> Completion {
        Completion {
            status: Status::Success,
            length,
            data: vec![0xaa; length as usize],
        }
    }

    #[test]
    fn test_empty_until_completed() {
        let (tx, rx) = completion_channel();
        assert!(rx.try_take().unwrap().is_none());

        tx.complete(completion(3)).unwrap();
        let received = rx.try_take().unwrap().unwrap();
        assert_eq!(received.length, 3);
        assert_eq!(received.data, vec![0xaa; 3]);
    }

    #[test]
    fn test_dropped_sender_is_error() {
        let (tx, rx) = completion_channel();
        drop(tx);
        assert!(matches!(rx.try_take(), Err(crate::Error::Channel(_))));
    }

    #[test]
    fn test_complete_after_receiver_gone() {
        let (tx, rx) = completion_channel();
        drop(rx);
        assert!(tx.complete(completion(0)).is_err());
    }

    #[test]
    fn test_completed_from_another_thread() {
        let (tx, rx) = completion_channel();
        std::thread::spawn(move || {
            tx.complete(completion(8)).unwrap();
        })
        .join()
        .unwrap();

        let received = rx.try_take().unwrap().unwrap();
        assert_eq!(received.length, 8);
        // Single shot: the sender is gone once it has completed
        assert!(rx.try_take().is_err());
    }
}
