use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A dashboard client's subscription information.
pub struct ClientSubscription {
    /// Subscribed symbols.
    pub symbols: HashSet<String>,
    /// Whether the client receives risk alerts.
    pub alerts: bool,
    /// Channel to send messages to the client.
    pub tx: mpsc::UnboundedSender<String>,
}

/// Manages dashboard WebSocket client subscriptions.
pub struct RoomManager {
    /// Client subscriptions keyed by client ID.
    pub clients: DashMap<Uuid, ClientSubscription>,
    /// Symbol rooms: symbol -> set of client IDs.
    rooms: DashMap<String, HashSet<Uuid>>,
    /// Clients subscribed to risk alerts.
    alert_room: DashMap<Uuid, ()>,
}

impl RoomManager {
    /// Create a new room manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
            alert_room: DashMap::new(),
        })
    }

    /// Register a new client.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients.insert(
            client_id,
            ClientSubscription {
                symbols: HashSet::new(),
                alerts: false,
                tx,
            },
        );
        client_id
    }

    /// Unregister a client and remove it from all rooms.
    pub fn unregister(&self, client_id: Uuid) {
        if let Some((_, subscription)) = self.clients.remove(&client_id) {
            for symbol in subscription.symbols {
                if let Some(mut room) = self.rooms.get_mut(&symbol) {
                    room.remove(&client_id);
                }
            }
        }
        self.alert_room.remove(&client_id);
    }

    /// Subscribe a client to symbols. Returns the symbols that were newly
    /// subscribed.
    pub fn subscribe(&self, client_id: Uuid, symbols: &[String]) -> Vec<String> {
        let mut subscribed = Vec::new();

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            for symbol in symbols {
                let symbol_upper = symbol.to_uppercase();
                if client.symbols.insert(symbol_upper.clone()) {
                    subscribed.push(symbol_upper.clone());

                    self.rooms
                        .entry(symbol_upper)
                        .or_insert_with(HashSet::new)
                        .insert(client_id);
                }
            }
        }

        subscribed
    }

    /// Unsubscribe a client from symbols. Returns the symbols that were
    /// actually removed.
    pub fn unsubscribe(&self, client_id: Uuid, symbols: &[String]) -> Vec<String> {
        let mut unsubscribed = Vec::new();

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            for symbol in symbols {
                let symbol_upper = symbol.to_uppercase();
                if client.symbols.remove(&symbol_upper) {
                    unsubscribed.push(symbol_upper.clone());

                    if let Some(mut room) = self.rooms.get_mut(&symbol_upper) {
                        room.remove(&client_id);
                    }
                }
            }
        }

        unsubscribed
    }

    /// Subscribe a client to risk alerts.
    pub fn subscribe_alerts(&self, client_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.alerts = true;
            self.alert_room.insert(client_id, ());
        }
    }

    /// Unsubscribe a client from risk alerts.
    pub fn unsubscribe_alerts(&self, client_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.alerts = false;
        }
        self.alert_room.remove(&client_id);
    }

    /// Broadcast a message to all clients subscribed to a symbol.
    pub fn broadcast(&self, symbol: &str, message: &str) {
        let client_ids: Vec<Uuid> = self
            .rooms
            .get(&symbol.to_uppercase())
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();

        for id in client_ids {
            if let Some(client) = self.clients.get(&id) {
                let _ = client.tx.send(message.to_string());
            }
        }
    }

    /// Broadcast a message to all alert subscribers.
    pub fn broadcast_alerts(&self, message: &str) {
        let client_ids: Vec<Uuid> = self.alert_room.iter().map(|e| *e.key()).collect();
        for id in client_ids {
            if let Some(client) = self.clients.get(&id) {
                let _ = client.tx.send(message.to_string());
            }
        }
    }

    /// Broadcast a message to all connected clients.
    pub fn broadcast_all(&self, message: &str) {
        for client in self.clients.iter() {
            let _ = client.tx.send(message.to_string());
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of symbol rooms with at least one subscriber.
    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|r| !r.is_empty()).count()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
            alert_room: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(manager: &RoomManager) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (manager.register(tx), rx)
    }

    #[test]
    fn test_subscribe_and_broadcast() {
        let manager = RoomManager::default();
        let (id, mut rx) = client(&manager);

        let subscribed = manager.subscribe(id, &["btcusdt".to_string()]);
        assert_eq!(subscribed, vec!["BTCUSDT".to_string()]);

        manager.broadcast("BTCUSDT", "tick");
        assert_eq!(rx.try_recv().unwrap(), "tick");

        // not subscribed to this one
        manager.broadcast("ETHUSDT", "other");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_subscribe_returns_empty() {
        let manager = RoomManager::default();
        let (id, _rx) = client(&manager);

        manager.subscribe(id, &["BTCUSDT".to_string()]);
        let again = manager.subscribe(id, &["BTCUSDT".to_string()]);
        assert!(again.is_empty());
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let manager = RoomManager::default();
        let (id, _rx) = client(&manager);

        let removed = manager.unsubscribe(id, &["BTCUSDT".to_string()]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_alert_room() {
        let manager = RoomManager::default();
        let (a, mut rx_a) = client(&manager);
        let (_b, mut rx_b) = client(&manager);

        manager.subscribe_alerts(a);
        manager.broadcast_alerts("alert!");

        assert_eq!(rx_a.try_recv().unwrap(), "alert!");
        assert!(rx_b.try_recv().is_err());

        manager.unsubscribe_alerts(a);
        manager.broadcast_alerts("again");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_unregister_cleans_rooms() {
        let manager = RoomManager::default();
        let (id, _rx) = client(&manager);

        manager.subscribe(id, &["BTCUSDT".to_string()]);
        manager.subscribe_alerts(id);
        assert_eq!(manager.client_count(), 1);
        assert_eq!(manager.room_count(), 1);

        manager.unregister(id);
        assert_eq!(manager.client_count(), 0);
        assert_eq!(manager.room_count(), 0);
    }
}
