use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mooring_core::error::PoolError;
use mooring_core::id::LeaseId;
use mooring_core::lease::{Lease, LeaseTicket, Recycle};

/// Records every resource handed back, in order.
#[derive(Default)]
struct Ledger {
    returned: Mutex<Vec<(LeaseId, String, bool)>>,
}

impl Recycle<String> for Ledger {
    fn recycle(&self, id: LeaseId, resource: String, healthy: bool) {
        self.returned.lock().push((id, resource, healthy));
    }
}

fn lend(ledger: &Arc<Ledger>, value: &str) -> (Lease<String>, Arc<LeaseTicket>) {
    let ticket = LeaseTicket::issue();
    let lease = Lease::new(value.to_string(), Arc::clone(&ticket), ledger.clone());
    (lease, ticket)
}

#[tokio::test]
async fn test_aborted_task_returns_its_lease_once() {
    let ledger = Arc::new(Ledger::default());
    let (lease, _) = lend(&ledger, "conn-1");
    let id = lease.id();

    let task = tokio::spawn(async move {
        let _held = lease;
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(
        *ledger.returned.lock(),
        vec![(id, "conn-1".to_string(), true)]
    );
}

#[tokio::test]
async fn test_panicking_task_returns_its_lease() {
    let ledger = Arc::new(Ledger::default());
    let (lease, _) = lend(&ledger, "conn-2");

    let task = tokio::spawn(async move {
        let _held = lease;
        panic!("handler failed");
    });
    assert!(task.await.unwrap_err().is_panic());
    assert_eq!(ledger.returned.lock().len(), 1);
}

#[tokio::test]
async fn test_revoked_lease_is_closed_not_reused() {
    let ledger = Arc::new(Ledger::default());
    let (mut lease, ticket) = lend(&ledger, "conn-3");
    let id = lease.id();

    assert!(ticket.revoke());
    assert!(!ticket.revoke());
    assert_eq!(lease.get_mut().unwrap_err(), PoolError::Revoked(id));

    drop(lease);
    let returned = ledger.returned.lock();
    assert_eq!(returned.len(), 1);
    assert!(!returned[0].2);
}
