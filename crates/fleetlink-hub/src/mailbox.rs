//! Per-device command mailboxes.
//!
//! One FIFO queue per device with single-consumer pull semantics. Delivery is
//! single-in-flight: while a delivered command is unacknowledged and within
//! the delivery timeout, no further command is handed out for that device.
//! Terminal commands are retained for a short window so duplicate acks from
//! retrying devices stay idempotent.
//!
//! Queues are partitioned by device id: each lives behind its own `Mutex`
//! inside a shared map, so operations on one device never block another's.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetlink_core::config::MailboxConfig;

use crate::error::{HubError, HubResult};
use crate::types::{Command, CommandOutcome, CommandState};

/// Buffered command frames per streaming subscriber. Single-in-flight
/// delivery means at most one command is outstanding anyway.
const SUBSCRIBER_BUFFER: usize = 8;

struct DeviceQueue {
    queued: VecDeque<Command>,
    /// The one delivered-but-unacknowledged command, if any.
    in_flight: Option<Command>,
    /// Recently terminal commands, kept for duplicate-ack tolerance.
    terminal: HashMap<String, (CommandState, Instant)>,
    /// Streaming subscriber, at most one per device, tagged with its
    /// subscription id so a superseded session cannot tear down its
    /// replacement.
    subscriber: Option<(u64, mpsc::Sender<Command>)>,
}

impl DeviceQueue {
    fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            in_flight: None,
            terminal: HashMap::new(),
            subscriber: None,
        }
    }

    /// Move an overdue in-flight command to the expired terminal state.
    fn expire_if_overdue(&mut self, timeout: Duration) -> Option<String> {
        let overdue = self
            .in_flight
            .as_ref()
            .and_then(|cmd| cmd.delivered_at)
            .is_some_and(|at| at.elapsed() > timeout);
        if !overdue {
            return None;
        }
        let mut cmd = self.in_flight.take()?;
        cmd.state = CommandState::Expired;
        warn!(
            device_id = %cmd.device_id,
            command_id = %cmd.command_id,
            "Delivered command expired without acknowledgment"
        );
        let id = cmd.command_id.clone();
        self.terminal
            .insert(id.clone(), (CommandState::Expired, Instant::now()));
        Some(id)
    }

    /// Pop the next queued command and mark it delivered, honoring the
    /// single-in-flight rule. Returns `None` when nothing is deliverable.
    fn deliver_next(&mut self, timeout: Duration) -> Option<Command> {
        self.expire_if_overdue(timeout);
        if self.in_flight.is_some() {
            return None;
        }
        let mut cmd = self.queued.pop_front()?;
        cmd.state = CommandState::Delivered;
        cmd.delivered_at = Some(Instant::now());
        self.in_flight = Some(cmd.clone());
        Some(cmd)
    }

    /// Undo a delivery whose handoff failed (e.g. subscriber channel gone).
    fn requeue_front(&mut self, mut cmd: Command) {
        cmd.state = CommandState::Queued;
        cmd.delivered_at = None;
        self.in_flight = None;
        self.queued.push_front(cmd);
    }
}

/// Thread-safe store of per-device command queues.
pub struct CommandMailbox {
    queues: RwLock<HashMap<String, Arc<Mutex<DeviceQueue>>>>,
    queue_cap: usize,
    delivery_timeout: Duration,
    terminal_retention: Duration,
    next_subscription: AtomicU64,
}

impl CommandMailbox {
    pub fn new(config: &MailboxConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            queue_cap: config.queue_cap,
            delivery_timeout: Duration::from_secs(config.delivery_timeout_secs),
            terminal_retention: Duration::from_secs(config.terminal_retention_secs),
            next_subscription: AtomicU64::new(0),
        }
    }

    async fn queue_for(&self, device_id: &str) -> Arc<Mutex<DeviceQueue>> {
        if let Some(queue) = self.queues.read().await.get(device_id) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().await;
        Arc::clone(
            queues
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(DeviceQueue::new()))),
        )
    }

    async fn existing_queue(&self, device_id: &str) -> Option<Arc<Mutex<DeviceQueue>>> {
        self.queues.read().await.get(device_id).cloned()
    }

    /// Enqueue a command for a device. Returns the fresh command id
    /// immediately; delivery happens on the device's next pull (or push, for
    /// a streaming subscriber).
    ///
    /// Eligibility (device known and approved) is the caller's concern; the
    /// mailbox is pure queue storage.
    pub async fn enqueue(
        &self,
        device_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> HubResult<String> {
        let queue = self.queue_for(device_id).await;
        let mut queue = queue.lock().await;

        if queue.queued.len() >= self.queue_cap {
            return Err(HubError::QueueFull(device_id.to_string()));
        }

        let command = Command {
            command_id: format!("cmd-{}", Uuid::new_v4()),
            device_id: device_id.to_string(),
            action: action.to_string(),
            payload,
            state: CommandState::Queued,
            enqueued_at: Instant::now(),
            delivered_at: None,
        };
        let command_id = command.command_id.clone();
        info!(device_id, command_id = %command_id, action, "Command enqueued");
        queue.queued.push_back(command);

        self.push_to_subscriber(&mut queue);
        Ok(command_id)
    }

    /// Pop the oldest queued command, mark it delivered, and return it.
    ///
    /// Returns `None` when the mailbox is empty or a delivered command is
    /// still in flight; never blocks, never errors.
    pub async fn dequeue_one(&self, device_id: &str) -> Option<Command> {
        let queue = self.existing_queue(device_id).await?;
        let mut queue = queue.lock().await;
        let cmd = queue.deliver_next(self.delivery_timeout)?;
        debug!(device_id, command_id = %cmd.command_id, "Command delivered (poll)");
        Some(cmd)
    }

    /// Record a device's execution report for a delivered command.
    ///
    /// Returns the resulting state. A duplicate ack within the retention
    /// window returns the already-recorded terminal state without changing
    /// it, so a retrying device and a late ack for an expired command are
    /// both harmless; a genuinely unknown command id returns `None`.
    pub async fn acknowledge(
        &self,
        device_id: &str,
        command_id: &str,
        outcome: CommandOutcome,
    ) -> Option<CommandState> {
        let queue = self.existing_queue(device_id).await?;
        let mut queue = queue.lock().await;
        queue.expire_if_overdue(self.delivery_timeout);

        let matches_in_flight = queue
            .in_flight
            .as_ref()
            .is_some_and(|cmd| cmd.command_id == command_id);
        if !matches_in_flight {
            if let Some((state, _)) = queue.terminal.get(command_id) {
                debug!(device_id, command_id, state = ?state, "Ignoring ack for terminal command");
                return Some(*state);
            }
            debug!(device_id, command_id, "Ignoring ack for unknown command");
            return None;
        }

        let mut cmd = queue.in_flight.take()?;
        cmd.state = match outcome {
            CommandOutcome::Success => CommandState::Acknowledged,
            CommandOutcome::Failure => CommandState::Failed,
        };
        info!(device_id, command_id, state = ?cmd.state, "Command acknowledged");
        queue
            .terminal
            .insert(cmd.command_id.clone(), (cmd.state, Instant::now()));

        // The slot is free again; hand the next command to a streaming
        // subscriber right away.
        self.push_to_subscriber(&mut queue);
        Some(cmd.state)
    }

    /// Number of queued (undelivered) commands for a device.
    pub async fn pending_count(&self, device_id: &str) -> usize {
        match self.existing_queue(device_id).await {
            Some(queue) => queue.lock().await.queued.len(),
            None => 0,
        }
    }

    /// Attach a streaming subscriber for a device, replacing any previous
    /// one. Deliverable commands are pushed into the returned channel; the
    /// returned id must be passed back to `unsubscribe`.
    pub async fn subscribe(&self, device_id: &str) -> (u64, mpsc::Receiver<Command>) {
        let subscription_id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let queue = self.queue_for(device_id).await;
        let mut queue = queue.lock().await;
        if queue.subscriber.is_some() {
            debug!(device_id, "Replacing existing mailbox subscriber");
        }
        queue.subscriber = Some((subscription_id, tx));
        // Drain any backlog that accumulated while the device was polling
        // or offline.
        self.push_to_subscriber(&mut queue);
        (subscription_id, rx)
    }

    /// Detach a streaming subscriber. Returns `true` if it was still the
    /// current one; a stale id (superseded session) is a no-op.
    pub async fn unsubscribe(&self, device_id: &str, subscription_id: u64) -> bool {
        let Some(queue) = self.existing_queue(device_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;
        if queue
            .subscriber
            .as_ref()
            .is_some_and(|(id, _)| *id == subscription_id)
        {
            queue.subscriber = None;
            return true;
        }
        false
    }

    /// Deliver the next command to the subscriber if the in-flight slot is
    /// free. Failed handoffs requeue the command and drop the subscriber.
    fn push_to_subscriber(&self, queue: &mut DeviceQueue) {
        let Some((_, subscriber)) = queue.subscriber.clone() else {
            return;
        };
        let Some(cmd) = queue.deliver_next(self.delivery_timeout) else {
            return;
        };
        match subscriber.try_send(cmd.clone()) {
            Ok(()) => {
                debug!(
                    device_id = %cmd.device_id,
                    command_id = %cmd.command_id,
                    "Command delivered (push)"
                );
            }
            Err(_) => {
                warn!(
                    device_id = %cmd.device_id,
                    command_id = %cmd.command_id,
                    "Subscriber channel unavailable, requeuing command"
                );
                queue.requeue_front(cmd);
                queue.subscriber = None;
            }
        }
    }

    /// Expire overdue in-flight commands across all devices. Returns the
    /// expired command ids.
    pub async fn expire_overdue(&self) -> Vec<String> {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for queue in queues {
            let mut queue = queue.lock().await;
            if let Some(id) = queue.expire_if_overdue(self.delivery_timeout) {
                expired.push(id);
                // The freed slot may unblock a streaming subscriber.
                self.push_to_subscriber(&mut queue);
            }
        }
        expired
    }

    /// Drop terminal records older than the retention window. Returns the
    /// count removed.
    pub async fn gc_terminal(&self) -> usize {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut removed = 0;
        for queue in queues {
            let mut queue = queue.lock().await;
            let before = queue.terminal.len();
            let retention = self.terminal_retention;
            queue.terminal.retain(|_, (_, at)| at.elapsed() < retention);
            removed += before - queue.terminal.len();
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn mailbox() -> CommandMailbox {
        CommandMailbox::new(&MailboxConfig::default())
    }

    fn mailbox_with(config: MailboxConfig) -> CommandMailbox {
        CommandMailbox::new(&config)
    }

    #[tokio::test]
    async fn commands_dequeue_in_fifo_order() {
        let mailbox = mailbox();
        let c1 = mailbox.enqueue("d1", "led_on", json!({})).await.unwrap();
        let c2 = mailbox.enqueue("d1", "led_off", json!({})).await.unwrap();
        let c3 = mailbox.enqueue("d1", "reboot", json!({})).await.unwrap();

        for expected in [c1, c2, c3] {
            let cmd = mailbox.dequeue_one("d1").await.unwrap();
            assert_eq!(cmd.command_id, expected);
            assert!(
                mailbox
                    .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
                    .await
                    .is_some()
            );
        }
        assert!(mailbox.dequeue_one("d1").await.is_none());
    }

    #[tokio::test]
    async fn fifo_holds_under_interleaved_devices() {
        let mailbox = mailbox();
        let a1 = mailbox.enqueue("a", "one", json!({})).await.unwrap();
        let b1 = mailbox.enqueue("b", "uno", json!({})).await.unwrap();
        let a2 = mailbox.enqueue("a", "two", json!({})).await.unwrap();

        assert_eq!(mailbox.dequeue_one("a").await.unwrap().command_id, a1);
        assert_eq!(mailbox.dequeue_one("b").await.unwrap().command_id, b1);
        mailbox.acknowledge("a", &a1, CommandOutcome::Success).await;
        assert_eq!(mailbox.dequeue_one("a").await.unwrap().command_id, a2);
    }

    #[tokio::test]
    async fn dequeue_empty_mailbox_returns_none() {
        let mailbox = mailbox();
        assert!(mailbox.dequeue_one("never-seen").await.is_none());
        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        assert!(mailbox.dequeue_one("other").await.is_none());
    }

    #[tokio::test]
    async fn delivered_command_blocks_further_dequeues() {
        let mailbox = mailbox();
        mailbox.enqueue("d1", "first", json!({})).await.unwrap();
        mailbox.enqueue("d1", "second", json!({})).await.unwrap();

        let first = mailbox.dequeue_one("d1").await.unwrap();
        assert_eq!(first.state, CommandState::Delivered);
        // Second poll before ack: single-in-flight blocks delivery
        assert!(mailbox.dequeue_one("d1").await.is_none());

        mailbox
            .acknowledge("d1", &first.command_id, CommandOutcome::Success)
            .await;
        assert_eq!(mailbox.dequeue_one("d1").await.unwrap().action, "second");
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let mailbox = mailbox();
        mailbox.enqueue("d1", "led_on", json!({})).await.unwrap();
        let cmd = mailbox.dequeue_one("d1").await.unwrap();

        let first = mailbox
            .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
            .await;
        assert_eq!(first, Some(CommandState::Acknowledged));

        // A retried ack reads back the recorded state without changing it,
        // even when the retry reports a different outcome
        let second = mailbox
            .acknowledge("d1", &cmd.command_id, CommandOutcome::Failure)
            .await;
        assert_eq!(second, Some(CommandState::Acknowledged));
    }

    #[tokio::test]
    async fn failure_outcome_marks_command_failed() {
        let mailbox = mailbox();
        mailbox.enqueue("d1", "led_on", json!({})).await.unwrap();
        let cmd = mailbox.dequeue_one("d1").await.unwrap();

        let state = mailbox
            .acknowledge("d1", &cmd.command_id, CommandOutcome::Failure)
            .await;
        assert_eq!(state, Some(CommandState::Failed));
    }

    #[tokio::test]
    async fn unknown_ack_is_a_no_op() {
        let mailbox = mailbox();
        assert!(
            mailbox
                .acknowledge("d1", "cmd-bogus", CommandOutcome::Success)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn overdue_delivery_expires_and_unblocks_queue() {
        let mailbox = mailbox_with(MailboxConfig {
            delivery_timeout_secs: 0,
            ..Default::default()
        });
        mailbox.enqueue("d1", "first", json!({})).await.unwrap();
        mailbox.enqueue("d1", "second", json!({})).await.unwrap();

        let first = mailbox.dequeue_one("d1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The expired slot frees up and the next command is delivered
        let second = mailbox.dequeue_one("d1").await.unwrap();
        assert_eq!(second.action, "second");

        // A late ack for the expired command reads back Expired; it is never
        // upgraded to Acknowledged
        assert_eq!(
            mailbox
                .acknowledge("d1", &first.command_id, CommandOutcome::Success)
                .await,
            Some(CommandState::Expired)
        );
    }

    #[tokio::test]
    async fn sweeper_expires_overdue_deliveries() {
        let mailbox = mailbox_with(MailboxConfig {
            delivery_timeout_secs: 0,
            ..Default::default()
        });
        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        let cmd = mailbox.dequeue_one("d1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = mailbox.expire_overdue().await;
        assert_eq!(expired, vec![cmd.command_id]);
        assert!(mailbox.expire_overdue().await.is_empty());
    }

    #[tokio::test]
    async fn queue_cap_rejects_new_enqueue_and_preserves_order() {
        let mailbox = mailbox_with(MailboxConfig {
            queue_cap: 50,
            ..Default::default()
        });
        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(
                mailbox
                    .enqueue("d1", &format!("cmd{i}"), json!({}))
                    .await
                    .unwrap(),
            );
        }

        let overflow = mailbox.enqueue("d1", "cmd50", json!({})).await;
        assert!(matches!(overflow, Err(HubError::QueueFull(_))));
        assert_eq!(mailbox.pending_count("d1").await, 50);

        // Original order intact
        let first = mailbox.dequeue_one("d1").await.unwrap();
        assert_eq!(first.command_id, ids[0]);
    }

    #[tokio::test]
    async fn queue_cap_is_per_device() {
        let mailbox = mailbox_with(MailboxConfig {
            queue_cap: 1,
            ..Default::default()
        });
        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        assert!(mailbox.enqueue("d2", "y", json!({})).await.is_ok());
        assert!(matches!(
            mailbox.enqueue("d1", "z", json!({})).await,
            Err(HubError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn subscriber_receives_backlog_then_pushes() {
        let mailbox = mailbox();
        mailbox.enqueue("d1", "first", json!({})).await.unwrap();

        let (_, mut rx) = mailbox.subscribe("d1").await;
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.action, "first");
        assert_eq!(cmd.state, CommandState::Delivered);

        // In-flight blocks the next push until the ack arrives
        mailbox.enqueue("d1", "second", json!({})).await.unwrap();
        assert!(rx.try_recv().is_err());

        mailbox
            .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
            .await;
        let next = rx.recv().await.unwrap();
        assert_eq!(next.action, "second");
    }

    #[tokio::test]
    async fn new_subscription_replaces_old_one() {
        let mailbox = mailbox();
        let (old_id, mut old_rx) = mailbox.subscribe("d1").await;
        let (_, mut new_rx) = mailbox.subscribe("d1").await;

        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        assert_eq!(new_rx.recv().await.unwrap().action, "x");
        assert!(old_rx.try_recv().is_err());

        // The superseded session's teardown must not detach the new one
        assert!(!mailbox.unsubscribe("d1", old_id).await);
        mailbox.enqueue("d1", "y", json!({})).await.unwrap();
        // Delivery still blocked by x in flight, but the subscriber is alive
        assert!(new_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_requeues_undelivered_command() {
        let mailbox = mailbox();
        let (_, rx) = mailbox.subscribe("d1").await;
        drop(rx);

        // Handoff fails, command must remain queued for polling
        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        assert_eq!(mailbox.pending_count("d1").await, 1);
        let cmd = mailbox.dequeue_one("d1").await.unwrap();
        assert_eq!(cmd.action, "x");
    }

    #[tokio::test]
    async fn unsubscribe_reverts_to_poll_delivery() {
        let mailbox = mailbox();
        let (id, _rx) = mailbox.subscribe("d1").await;
        assert!(mailbox.unsubscribe("d1", id).await);

        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        assert!(mailbox.dequeue_one("d1").await.is_some());
    }

    #[tokio::test]
    async fn terminal_gc_bounds_duplicate_ack_recognition() {
        let mailbox = mailbox_with(MailboxConfig {
            terminal_retention_secs: 0,
            ..Default::default()
        });
        mailbox.enqueue("d1", "x", json!({})).await.unwrap();
        let cmd = mailbox.dequeue_one("d1").await.unwrap();
        mailbox
            .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
            .await;

        // Inside the retention window the duplicate is recognized
        assert_eq!(
            mailbox
                .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
                .await,
            Some(CommandState::Acknowledged)
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mailbox.gc_terminal().await, 1);

        // Past it the record is gone and the id reads as unknown
        assert!(
            mailbox
                .acknowledge("d1", &cmd.command_id, CommandOutcome::Success)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_duplicate_a_command() {
        let mailbox = Arc::new(mailbox());
        mailbox.enqueue("d1", "only", json!({})).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mb = Arc::clone(&mailbox);
            handles.push(tokio::spawn(async move { mb.dequeue_one("d1").await }));
        }
        let mut hits = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);
    }
}
