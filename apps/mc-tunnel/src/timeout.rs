//! Deadline racing for the blocking steps of connection setup.
//!
//! Every setup-phase suspension point (path discovery, TCP dial, listener
//! bind, token file I/O) goes through [`run_with_timeout`] so that no setup
//! call can block its caller past a known bound.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::error::TunnelError;

pub const PATH_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TCP_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const FILE_IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TimeoutError<E> {
    #[error("{operation} timed out after {timeout:?}")]
    Elapsed { operation: String, timeout: Duration },
    #[error("{operation} aborted: {reason}")]
    Aborted { operation: String, reason: String },
    #[error("{0}")]
    Failed(E),
}

/// Runs `future` on its own task and races it against `timeout`.
///
/// The operation runs to completion in the background unless the deadline
/// fires first, in which case the task is aborted at its next await point
/// and its result is never observed. A zero `timeout` has already expired:
/// the operation is dropped without being started.
pub async fn run_with_timeout<T, E, F>(
    operation: impl Into<String>,
    timeout: Duration,
    future: F,
) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let operation = operation.into();
    if timeout.is_zero() {
        tracing::debug!(
            target = "mc_tunnel::timeout",
            operation = %operation,
            "deadline already expired"
        );
        return Err(TimeoutError::Elapsed { operation, timeout });
    }
    let mut task = tokio::spawn(future);
    tracing::trace!(
        target = "mc_tunnel::timeout",
        operation = %operation,
        timeout = ?timeout,
        state = "start"
    );
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(TimeoutError::Failed(err)),
        Ok(Err(join_err)) => Err(TimeoutError::Aborted {
            operation,
            reason: join_err.to_string(),
        }),
        Err(_) => {
            task.abort();
            tracing::debug!(
                target = "mc_tunnel::timeout",
                operation = %operation,
                timeout = ?timeout,
                "operation timed out"
            );
            Err(TimeoutError::Elapsed { operation, timeout })
        }
    }
}

/// Dials `address` over TCP, failing with [`TunnelError::Dial`] on refusal or
/// once `timeout` elapses.
pub async fn dial_timeout(address: &str, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let target = address.to_string();
    run_with_timeout(format!("dial tcp://{address}"), timeout, async move {
        TcpStream::connect(target).await
    })
    .await
    .map_err(|err| TunnelError::Dial {
        address: address.to_string(),
        reason: err.to_string(),
    })
}

/// Binds a TCP listener on `address`, failing with [`TunnelError::Listen`].
pub async fn listen_timeout(
    address: SocketAddr,
    timeout: Duration,
) -> Result<TcpListener, TunnelError> {
    run_with_timeout(format!("listen tcp://{address}"), timeout, async move {
        TcpListener::bind(address).await
    })
    .await
    .map_err(|err| TunnelError::Listen {
        address: address.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn returns_operation_result() {
        let value: Result<u32, TimeoutError<std::io::Error>> =
            run_with_timeout("answer", Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn passes_operation_failure_through() {
        let result: Result<(), TimeoutError<String>> =
            run_with_timeout("failing", Duration::from_secs(1), async {
                Err("boom".to_string())
            })
            .await;
        match result {
            Err(TimeoutError::Failed(reason)) => assert_eq!(reason, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn elapsed_carries_name_and_duration() {
        let result: Result<(), TimeoutError<String>> =
            run_with_timeout("slow op", Duration::from_millis(20), async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        match result {
            Err(TimeoutError::Elapsed { operation, timeout }) => {
                assert_eq!(operation, "slow op");
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_operation_never_completes() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let result: Result<(), TimeoutError<String>> =
            run_with_timeout("abandoned", Duration::from_millis(20), async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(TimeoutError::Elapsed { .. })));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_deadline_never_starts_the_operation() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let result: Result<(), TimeoutError<String>> =
            run_with_timeout("expired", Duration::ZERO, async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(TimeoutError::Elapsed { timeout, .. }) if timeout.is_zero()
        ));
        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_operation_is_reported_as_aborted() {
        let result: Result<(), TimeoutError<String>> =
            run_with_timeout("panicky", Duration::from_secs(1), async {
                let explode = true;
                if explode {
                    panic!("operation blew up");
                }
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(TimeoutError::Aborted { .. })));
    }

    #[tokio::test]
    async fn dial_refused_fails_within_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = Instant::now();
        let err = dial_timeout(&address, Duration::from_secs(2))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, TunnelError::Dial { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn listen_on_taken_port_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap();
        let err = listen_timeout(address, Duration::from_secs(2))
            .await
            .expect_err("port already bound");
        assert!(matches!(err, TunnelError::Listen { .. }));
    }
}
