//! Lock store integration tests.

use std::sync::Arc;
use std::time::Duration;

use tape_models::JobId;
use tape_store::LockStore;

fn lock_store() -> LockStore {
    dotenvy::dotenv().ok();
    LockStore::from_env().expect("Failed to create lock store")
}

/// Exactly one of many concurrent acquisition attempts may win.
#[tokio::test]
#[ignore = "requires Redis"]
async fn concurrent_acquisition_has_single_winner() {
    let locks = Arc::new(lock_store());
    let job_id = JobId::new();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let locks = Arc::clone(&locks);
        let job_id = job_id.clone();
        handles.push(tokio::spawn(async move {
            locks.acquire(&job_id).await.expect("acquire failed")
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        if let Some(token) = handle.await.expect("task panicked") {
            tokens.push(token);
        }
    }

    assert_eq!(tokens.len(), 1, "exactly one acquisition must succeed");

    locks.force_delete(&job_id).await.expect("cleanup failed");
}

/// A mismatched token must not affect a lease owned by another token.
#[tokio::test]
#[ignore = "requires Redis"]
async fn stale_token_release_and_extend_are_noops() {
    let locks = lock_store();
    let job_id = JobId::new();

    let token = locks
        .acquire(&job_id)
        .await
        .expect("acquire failed")
        .expect("no competing lock expected");

    assert!(!locks.release(&job_id, "not-the-token").await.unwrap());
    assert!(locks.exists(&job_id).await.unwrap(), "lease must survive");

    assert!(!locks
        .extend(&job_id, "not-the-token", Duration::from_secs(60))
        .await
        .unwrap());

    let info = locks.peek(&job_id).await.unwrap().expect("lease must be live");
    assert_eq!(info.token, token);

    assert!(locks.release(&job_id, &token).await.unwrap());
    assert!(!locks.exists(&job_id).await.unwrap());
}

/// Once released, the lease is immediately reclaimable.
#[tokio::test]
#[ignore = "requires Redis"]
async fn release_makes_lease_reclaimable() {
    let locks = lock_store();
    let job_id = JobId::new();

    let first = locks.acquire(&job_id).await.unwrap().expect("first claim");
    assert!(locks.acquire(&job_id).await.unwrap().is_none());

    assert!(locks.release(&job_id, &first).await.unwrap());
    let second = locks.acquire(&job_id).await.unwrap().expect("second claim");
    assert_ne!(first, second, "tokens must be unique per acquisition");

    locks.force_delete(&job_id).await.unwrap();
}

/// Extension with the holder's token pushes the expiry forward.
#[tokio::test]
#[ignore = "requires Redis"]
async fn holder_extension_pushes_expiry() {
    let locks = lock_store();
    let job_id = JobId::new();

    let token = locks.acquire(&job_id).await.unwrap().expect("claim");
    let before = locks.peek(&job_id).await.unwrap().expect("live").remaining;

    assert!(locks
        .extend(&job_id, &token, Duration::from_secs(120))
        .await
        .unwrap());

    let after = locks.peek(&job_id).await.unwrap().expect("live").remaining;
    assert!(after > before, "remaining TTL must grow after extension");

    locks.force_delete(&job_id).await.unwrap();
}
