//! Postgres ticket repository. Needs a database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/tickets_test cargo test -- --ignored
//! ```

#![cfg(feature = "database")]

use sqlx::PgPool;

use transit_tickets::database::init_pool;
use transit_tickets::database::ticket_repository::TicketRepository;
use transit_tickets::database::TicketStore;
use transit_tickets::tickets::code::random_code;
use transit_tickets::tickets::{NewTicket, SyncRecord, SyncStatus, TicketStatus, TicketType};

const NOW: i64 = 1_700_000_000;

async fn pool() -> PgPool {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/tickets_test".to_string());
    init_pool(&database_url, None)
        .await
        .expect("Failed to create test database pool")
}

fn new_ticket(valid_from: i64) -> NewTicket {
    NewTicket {
        code: random_code(&mut rand::thread_rng()),
        ticket_type: TicketType::ThirtyMinutes,
        valid_from,
        // Unique per run so reruns against the same database do not collide.
        order_id: i64::from(rand::random::<u32>()) + 1_000_000,
        user_id: None,
        email: Some("jane@example.com".to_string()),
        amount_cents: 120,
        currency: "EUR".to_string(),
        created_at: valid_from,
    }
}

#[tokio::test]
#[ignore]
async fn second_ticket_for_an_order_is_refused() {
    let repo = TicketRepository::new(pool().await);

    let request = new_ticket(NOW);
    let first = repo.insert(request.clone()).await.unwrap().unwrap();
    assert_eq!(first.valid_to - first.valid_from, 1800);
    assert_eq!(first.sync_status, SyncStatus::Pending);

    let duplicate = NewTicket {
        code: random_code(&mut rand::thread_rng()),
        ..request
    };
    assert!(repo.insert(duplicate).await.unwrap().is_none());
    assert_eq!(
        repo.find_by_order(first.order_id).await.unwrap().unwrap().id,
        first.id
    );
    assert!(repo.code_exists(&first.code).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn sync_record_and_expiry_round_trip() {
    let repo = TicketRepository::new(pool().await);
    let ticket = repo.insert(new_ticket(NOW - 7200)).await.unwrap().unwrap();

    repo.record_sync(
        ticket.id,
        &SyncRecord::failed("DPMK", 1, "down".to_string()),
    )
    .await
    .unwrap();
    assert!(repo
        .find_retryable(5, 1000)
        .await
        .unwrap()
        .contains(&ticket.id));

    let stored = repo.get(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Failed);
    assert_eq!(stored.provider_attempts, 1);
    assert_eq!(stored.provider_last_error.as_deref(), Some("down"));

    let mut expired = Vec::new();
    loop {
        let batch = repo.expire_overdue(NOW, 50).await.unwrap();
        if batch.is_empty() {
            break;
        }
        expired.extend(batch);
    }
    assert!(expired.contains(&ticket.id));
    let stored = repo.get(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Expired);
}

#[tokio::test]
#[ignore]
async fn email_counter_and_recovery_token() {
    let repo = TicketRepository::new(pool().await);
    let ticket = repo.insert(new_ticket(NOW)).await.unwrap().unwrap();

    assert_eq!(repo.reserve_email_send(ticket.id, 2).await.unwrap(), Some(1));
    assert_eq!(repo.reserve_email_send(ticket.id, 2).await.unwrap(), Some(2));
    assert_eq!(repo.reserve_email_send(ticket.id, 2).await.unwrap(), None);
    repo.record_email_recipient(ticket.id, "other@example.com")
        .await
        .unwrap();

    let token = uuid::Uuid::new_v4().to_string();
    repo.set_recovery(ticket.id, &token, NOW + 604_800)
        .await
        .unwrap();

    let found = repo.find_by_recovery_token(&token).await.unwrap().unwrap();
    assert_eq!(found.id, ticket.id);
    assert_eq!(found.email.as_deref(), Some("jane@example.com"));
    assert_eq!(found.email_send_count, 2);
    assert_eq!(found.recovery_expires_at, Some(NOW + 604_800));
}
