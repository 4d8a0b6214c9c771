use std::sync::Arc;

use futures::future::join_all;
use kestrel::domain::AccountId;
use kestrel::error::{KestrelError, ReservationError};
use kestrel::strategy::{CapitalConfig, CapitalReservationManager, ReservationStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn ledger(accounts: &[(&str, Decimal)]) -> Arc<CapitalReservationManager> {
    let manager = Arc::new(CapitalReservationManager::new(CapitalConfig::default()));
    for (id, equity) in accounts {
        manager.register_account(AccountId::from(*id), *equity).await;
    }
    manager
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_reservations_never_exceed_limit() {
    let manager = ledger(&[("alice", dec!(1000))]).await;
    let alice = AccountId::from("alice");

    let attempts = (0..200).map(|i| {
        let manager = manager.clone();
        let alice = alice.clone();
        tokio::spawn(async move {
            manager
                .try_reserve(&alice, &format!("pos-{}", i), "BTC", dec!(7))
                .await
        })
    });

    let granted = join_all(attempts)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    // limit = 1000 * (1 - 0.10) = 900; 900 / 7 = 128.57
    assert_eq!(granted, 128);
    let snap = manager.snapshot(&alice).await.unwrap();
    assert_eq!(snap.reserved_total, dec!(896));
    assert!(snap.reserved_total <= snap.limit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_account_cannot_spend_another_accounts_capital() {
    let manager = ledger(&[("rich", dec!(10000)), ("poor", dec!(100))]).await;
    let rich = AccountId::from("rich");
    let poor = AccountId::from("poor");

    let rich_task = {
        let manager = manager.clone();
        let rich = rich.clone();
        tokio::spawn(async move {
            let mut granted = 0;
            for i in 0..50 {
                if manager.try_reserve(&rich, &format!("r-{}", i), "ETH", dec!(100)).await {
                    granted += 1;
                }
            }
            granted
        })
    };
    let poor_task = {
        let manager = manager.clone();
        let poor = poor.clone();
        tokio::spawn(async move {
            let mut granted = 0;
            for i in 0..50 {
                if manager.try_reserve(&poor, &format!("p-{}", i), "ETH", dec!(30)).await {
                    granted += 1;
                }
            }
            granted
        })
    };

    assert_eq!(rich_task.await.unwrap(), 50);
    assert_eq!(poor_task.await.unwrap(), 3);
    assert_eq!(manager.snapshot(&poor).await.unwrap().reserved_total, dec!(90));
}

#[tokio::test]
async fn unknown_fate_holds_capital_until_resolved() {
    let manager = ledger(&[("alice", dec!(100))]).await;
    let alice = AccountId::from("alice");

    manager.reserve(&alice, "pos-1", "BTC", dec!(80)).await.unwrap();
    manager.mark_submitted("pos-1", "coid-1", Decimal::ZERO).await.unwrap();
    manager.mark_fate_unknown("pos-1").await.unwrap();

    let err = manager.release("pos-1").await.unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Reservation(ReservationError::FateUnresolved { .. })
    ));
    assert!(!manager.try_reserve(&alice, "pos-2", "ETH", dec!(20)).await);

    manager.resolve_rejected("pos-1").await.unwrap();
    assert!(manager.reservation("pos-1").await.is_none());
    assert!(manager.try_reserve(&alice, "pos-2", "ETH", dec!(20)).await);
    assert_eq!(
        manager.reservation("pos-2").await.unwrap().status,
        ReservationStatus::Pending
    );
}
