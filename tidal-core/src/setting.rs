//! Time-varying configuration values.
//!
//! A [`Setting`] only ever answers "what is the current value" and "tell me
//! when it changes". Intermediate values a slow reader missed are dropped.

use tokio::sync::watch;

/// Shared, observable value with latest-wins semantics.
#[derive(Debug)]
pub struct Setting<T> {
    sender: watch::Sender<T>,
}

impl<T> Clone for Setting<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Setting<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Returns a copy of the current value.
    pub fn sample(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Publishes a new value to every subscriber.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Applies `update` to the current value and publishes the result.
    pub fn update(&self, update: impl FnOnce(&mut T)) {
        self.sender.send_modify(update);
    }

    /// Receiver observing the current and all future values.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Setting<T> {
    /// Publishes `value` only if it differs from the current one.
    ///
    /// Returns true when subscribers were notified.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Default for Setting<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_sample_returns_latest() {
        let setting = Setting::new(1);
        setting.set(2);
        setting.set(3);
        assert_eq!(setting.sample(), 3);
    }

    #[test]
    fn test_update_in_place() {
        let setting = Setting::new(vec![1]);
        setting.update(|values| values.push(2));
        assert_eq!(setting.sample(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_latest_value() {
        let setting = Setting::new(0);
        let mut receiver = setting.subscribe();

        setting.set(1);
        setting.set(2);

        receiver.changed().await.unwrap();
        assert_eq!(*receiver.borrow_and_update(), 2);

        let pending = tokio::time::timeout(Duration::from_millis(20), receiver.changed()).await;
        assert!(pending.is_err(), "stale values must not be replayed");
    }

    #[tokio::test]
    async fn test_set_if_changed_suppresses_duplicates() {
        let setting = Setting::new("a".to_string());
        let receiver = setting.subscribe();

        assert!(!setting.set_if_changed("a".to_string()));
        assert!(!receiver.has_changed().unwrap());

        assert!(setting.set_if_changed("b".to_string()));
        assert!(receiver.has_changed().unwrap());
    }
}
