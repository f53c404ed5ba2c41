/*!
Utilitaires de test pour le banc

- initialisation des logs (log/env_logger et tracing) une seule fois
- attente active bornée sur une condition (statut, nombre d'échantillons...)
*/

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Active les logs pour les tests ; sans effet si déjà fait
pub fn init_tracing() {
    env_logger::builder().is_test(true).try_init().ok();
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Attend que `cond` devienne vraie, vérifiée toutes les 10 ms
pub async fn wait_until<F>(timeout_ms: u64, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    if cond() {
        return Ok(());
    }
    log::warn!("⏰ Timeout after {}ms waiting for condition", timeout_ms);
    anyhow::bail!("Condition not met within {}ms", timeout_ms);
}

/// Attend une valeur produite par `probe`
pub async fn wait_for<T, F>(timeout_ms: u64, mut probe: F) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let start = std::time::Instant::now();

    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }
        if start.elapsed() >= Duration::from_millis(timeout_ms) {
            anyhow::bail!("No value produced within {}ms", timeout_ms);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Borne une future quelconque (réception broadcast, join...)
pub async fn within<F: Future>(timeout_ms: u64, fut: F) -> Result<F::Output> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
        .await
        .map_err(|_| anyhow::anyhow!("Future did not complete within {}ms", timeout_ms))
}
