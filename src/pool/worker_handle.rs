//! A handle/listener pair used purely for liveness tracking: once every clone of the handle is
//! dropped, the listener's `wait_for_all_handle_drops` future resolves. No message is ever sent
//! over the channel; its only purpose is that `mpsc::Receiver::recv()` returns `None` once every
//! `Sender` has gone away.

use tokio::sync::mpsc;

pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
    let (sender, receiver) = mpsc::channel(1);
    (WorkerHandle(sender), WorkerHandleListener(receiver))
}

#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle(mpsc::Sender<std::convert::Infallible>);

#[derive(Debug)]
pub(crate) struct WorkerHandleListener(mpsc::Receiver<std::convert::Infallible>);

impl WorkerHandleListener {
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        // `recv` only ever returns `None`, once every sender has been dropped; nothing is ever
        // sent through this channel.
        let _ = self.0.recv().await;
    }
}
