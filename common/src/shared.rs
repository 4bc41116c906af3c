use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Cloneable handle to a value behind an async mutex. Used where several
/// tasks take turns owning one resource, such as a channel receiver.
#[derive(Debug)]
pub struct Shared<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Shared;

    #[tokio::test]
    async fn clones_share_the_value() {
        let shared = Shared::new(Vec::<u32>::new());
        let other = shared.clone();

        other.lock().await.push(7);

        assert_eq!(*shared.lock().await, vec![7]);
        assert_eq!(shared.handle_count(), 2);
    }
}
