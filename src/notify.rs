use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::DeviceCommand;

const CHANNEL_CAPACITY: usize = 64;

/// Broadcast hub for device commands, keyed by device-facing resource id.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<DeviceCommand>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to commands for a device. Creates the channel if needed.
    pub fn subscribe(&self, device_id: &str) -> broadcast::Receiver<DeviceCommand> {
        self.channels
            .entry(device_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a command. Returns how many subscribers received it (0 if none).
    pub fn send(&self, device_id: &str, command: DeviceCommand) -> usize {
        match self.channels.get(device_id) {
            Some(sender) => sender.send(command).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel for a device (e.g. when its resource is deleted).
    pub fn remove(&self, device_id: &str) {
        self.channels.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("locker-7");

        let cmd = DeviceCommand::Release {
            resource_id: "locker-7".into(),
        };
        assert_eq!(hub.send("locker-7", cmd.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), cmd);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sent = hub.send(
            "nobody",
            DeviceCommand::Release {
                resource_id: "nobody".into(),
            },
        );
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn remove_closes_channel() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("lab-2");
        hub.remove("lab-2");
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn receiver_waits_until_command_arrives() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("lab-3");
        let mut recv = tokio_test::task::spawn(async move { rx.recv().await });
        tokio_test::assert_pending!(recv.poll());

        hub.send(
            "lab-3",
            DeviceCommand::Release {
                resource_id: "lab-3".into(),
            },
        );
        assert!(recv.is_woken());
        let got = tokio_test::assert_ready!(recv.poll());
        assert!(matches!(got, Ok(DeviceCommand::Release { .. })));
    }
}
