//! Cross-tab broadcast of locally written menus.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::WeekMenu;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MenuBroadcast {
    pub origin: Uuid,
    pub menu: WeekMenu,
}

/// Shared by every engine writing to the same local cache slot.
#[derive(Clone)]
pub struct MenuChannel {
    tx: broadcast::Sender<MenuBroadcast>,
}

impl MenuChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a snapshot. Having no listeners is not an error.
    pub fn publish(&self, origin: Uuid, menu: WeekMenu) {
        let _ = self.tx.send(MenuBroadcast { origin, menu });
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MenuBroadcast> {
        self.tx.subscribe()
    }
}

impl Default for MenuChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let channel = MenuChannel::new();
        // No subscribers yet
        channel.publish(Uuid::new_v4(), WeekMenu::fresh(None));

        let mut rx = channel.subscribe();
        let origin = Uuid::new_v4();
        let menu = WeekMenu::fresh(Some("sub-1".to_string()));
        channel.publish(origin, menu.clone());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.origin, origin);
        assert_eq!(msg.menu, menu);
    }
}
