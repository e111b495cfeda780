//! Address reachability probes
//!
//! A probe tries a TCP connect to the registered ports of an address within
//! a hard timeout. A refused connection still proves the host answered, so
//! only timeouts and network-level failures count as unreachable. The first
//! port to answer settles the probe.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Why an address was judged unreachable
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("address unreachable: {0}")]
    Unreachable(String),
}

/// Reachability check for one address
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `ip` using the given ports; `Ok` means the host answered
    async fn probe(&self, ip: IpAddr, ports: &[u16], timeout: Duration) -> Result<(), ProbeError>;
}

/// TCP connect prober
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: IpAddr, ports: &[u16], timeout: Duration) -> Result<(), ProbeError> {
        let attempts = ports
            .iter()
            .map(|&port| {
                async move {
                    let addr = SocketAddr::new(ip, port);
                    match TcpStream::connect(addr).await {
                        Ok(_) => Ok(()),
                        Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(()),
                        Err(e) => {
                            trace!(%addr, error = %e, "Probe connect failed");
                            Err(e.to_string())
                        }
                    }
                }
                .boxed()
            })
            .collect();

        match tokio::time::timeout(timeout, first_answer(attempts)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Unreachable(format!("no port on {ip} answered: {e}"))),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }
}

/// Resolve on the first successful attempt; fails once every attempt has failed
async fn first_answer(attempts: Vec<BoxFuture<'_, Result<(), String>>>) -> Result<(), String> {
    if attempts.is_empty() {
        return Err("no ports to try".to_string());
    }
    futures::future::select_ok(attempts).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_answer_does_not_wait_for_stalled_ports() {
        let attempts = vec![
            futures::future::pending::<Result<(), String>>().boxed(),
            async { Ok::<(), String>(()) }.boxed(),
        ];
        let result = tokio::time::timeout(Duration::from_secs(1), first_answer(attempts)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_first_answer_fails_when_every_port_fails() {
        let attempts = vec![
            async { Err::<(), _>("reset".to_string()) }.boxed(),
            async { Err::<(), _>("unreachable".to_string()) }.boxed(),
        ];
        assert!(first_answer(attempts).await.is_err());
        assert!(first_answer(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_listening_port_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = TcpProber
            .probe("127.0.0.1".parse().unwrap(), &[port], Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_refused_port_still_counts_as_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpProber
            .probe("127.0.0.1".parse().unwrap(), &[port], Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }
}
