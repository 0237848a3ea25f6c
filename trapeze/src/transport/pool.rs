use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use trapeze_core::{PoolConfig, TaskError};

/// Bounds the number of requests in flight across all virtual users.
///
/// When every slot is taken, callers wait up to `acquire_timeout` and then fail their task
/// rather than opening another connection.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            size: config.max_connections,
            acquire_timeout: config.acquire_timeout,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, TaskError> {
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(TaskError::Transport("connection pool closed".to_string())),
            Err(_) => Err(TaskError::PoolExhausted(self.acquire_timeout)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_use(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_connections: 2,
            acquire_timeout: Duration::from_millis(50),
        });

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        assert_eq!(
            pool.acquire().await.unwrap_err(),
            TaskError::PoolExhausted(Duration::from_millis(50))
        );

        drop(a);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_released_permit() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(1),
        });

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
