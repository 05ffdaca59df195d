//! Per-session worker draining the command queue.
//!
//! A dispatcher is tagged with the generation of the connection it serves
//! and holds the exclusive queue consumer for as long as it runs. The
//! session manager cancels it cooperatively on transport failure: an
//! in-flight transmit is allowed to finish, but no further command is
//! pulled, and the remaining queued items persist for the dispatcher of the
//! next generation.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{protocol::Command, queue::QueueConsumer};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct Error(pub String);

/// One-way outbound transport for a single connection generation.
#[async_trait]
pub trait Transport: Send {
    async fn transmit(&mut self, command: &Command) -> Result<()>;
}

/// Drains the command queue onto a [`Transport`] until cancelled or the
/// transport fails.
pub struct Dispatcher {
    generation: u64,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(generation: u64, cancel: CancellationToken) -> Self {
        Self { generation, cancel }
    }

    /// Runs the drain loop.
    ///
    /// Returns `Ok` when cancelled and `Err` when the transport fails. The
    /// consumer handle is released on return either way; a command whose
    /// transmit failed has indeterminate remote-receipt status.
    pub async fn run<T>(self, mut consumer: QueueConsumer, mut transport: T) -> Result<()>
    where
        T: Transport,
    {
        debug!("dispatcher {} started", self.generation);

        loop {
            let command = tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,
                command = consumer.next() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            // Cancellation takes effect before the next pull, never during
            // an in-flight transmit.
            transport.transmit(&command).await?;
            trace!("dispatcher {} sent {command:?}", self.generation);
        }

        debug!("dispatcher {} stopped", self.generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{protocol::PlaybackState, queue::CommandQueue};

    fn status(n: usize) -> Command {
        Command::StatusUpdate {
            state: PlaybackState::Playing,
            song: Some(format!("song {n}")),
        }
    }

    /// Records transmitted commands; fails each transmit past `limit`.
    #[derive(Clone)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Command>>>,
        limit: Option<usize>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                limit: None,
            }
        }

        fn failing_after(limit: usize) -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                limit: Some(limit),
            }
        }

        fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn transmit(&mut self, command: &Command) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if self.limit.is_some_and(|limit| sent.len() >= limit) {
                return Err(Error("connection reset".to_string()));
            }
            sent.push(command.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transmits_in_fifo_order() {
        let queue = CommandQueue::new();
        for n in 1..=3 {
            queue.enqueue(status(n)).await;
        }

        let cancel = CancellationToken::new();
        let transport = RecordingTransport::new();
        let worker = tokio::spawn(Dispatcher::new(1, cancel.clone()).run(
            queue.consumer().await,
            transport.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(transport.sent(), vec![status(1), status(2), status(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_queued_commands_for_the_next_generation() {
        let queue = CommandQueue::new();

        // Cancel before the dispatcher starts pulling: nothing may be
        // transmitted and everything must remain queued.
        let cancel = CancellationToken::new();
        cancel.cancel();

        for n in 1..=4 {
            queue.enqueue(status(n)).await;
        }

        let transport = RecordingTransport::new();
        Dispatcher::new(1, cancel)
            .run(queue.consumer().await, transport.clone())
            .await
            .unwrap();
        assert!(transport.sent().is_empty());

        let successor = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Dispatcher::new(2, cancel.clone()).run(
            queue.consumer().await,
            successor.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(
            successor.sent(),
            vec![status(1), status(2), status(3), status(4)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_command_is_delivered_twice_across_a_reconnect() {
        let queue = CommandQueue::new();
        for n in 1..=4 {
            queue.enqueue(status(n)).await;
        }

        // First generation: the transport fails on the third transmit, as a
        // mid-session connection loss would.
        let failing = RecordingTransport::failing_after(2);
        let result = Dispatcher::new(1, CancellationToken::new())
            .run(queue.consumer().await, failing.clone())
            .await;
        assert!(result.is_err());
        assert_eq!(failing.sent(), vec![status(1), status(2)]);

        // Second generation resumes draining what the first left behind.
        // Command 3 was in flight when the transport failed, so its receipt
        // is indeterminate; it must not be re-delivered.
        let successor = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Dispatcher::new(2, cancel.clone()).run(
            queue.consumer().await,
            successor.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(successor.sent(), vec![status(4)]);
    }
}
