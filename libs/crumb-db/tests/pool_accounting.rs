//! Slot accounting on login services against a real Postgres schema.
//!
//! `#[sqlx::test]` creates a scratch database per test from `DATABASE_URL`
//! and applies `./migrations` before the body runs.

use crumb_db::models::access::{Activation, Release, UserServiceStatus};
use crumb_db::models::cookie::CookieStatus;
use crumb_db::repositories::cookie_repo::CookieRepository;
use crumb_db::repositories::login_service_repo::LoginServiceRepository;
use crumb_db::repositories::user_service_repo::{RequestOutcome, UserServiceRepository};
use sqlx::PgPool;
use uuid::Uuid;

async fn user(pool: &PgPool, email: &str) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO users (email, full_name, password_hash) VALUES ($1, 'Test User', 'x') RETURNING id",
    )
    .bind(email)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn service(pool: &PgPool, name: &str) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO services (name, display_name, login_url) VALUES ($1, $1, 'https://example.com/login') RETURNING id",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn login_service(pool: &PgPool, service_id: Uuid, max: i32, current: i32) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO login_services (service_id, username, encrypted_password, max_concurrent_users, current_users)
        VALUES ($1, 'shared', 'secret', $2, $3)
        RETURNING id
        "#,
    )
    .bind(service_id)
    .bind(max)
    .bind(current)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn pending(pool: &PgPool, user_id: Uuid, service_id: Uuid) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO user_services (user_id, service_id, status) VALUES ($1, $2, 'pending') RETURNING id",
    )
    .bind(user_id)
    .bind(service_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn current_users(pool: &PgPool, login_service_id: Uuid) -> i32 {
    sqlx::query_scalar("SELECT current_users FROM login_services WHERE id = $1")
        .bind(login_service_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn subscribe(pool: &PgPool, user_id: Uuid, max_services: i32) {
    let plan_id: Uuid = sqlx::query_scalar(
        "INSERT INTO subscription_plans (name, price_cents, duration_days, max_services) VALUES ('Basic', 999, 30, $1) RETURNING id",
    )
    .bind(max_services)
    .fetch_one(pool)
    .await
    .unwrap();
    let payment_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO payments (user_id, plan_id, amount_cents, status, method, transaction_id)
        VALUES ($1, $2, 999, 'success', 'card', $3)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(plan_id)
    .bind(Uuid::new_v4().to_string())
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO user_subscriptions (user_id, plan_id, payment_id, expires_at)
        VALUES ($1, $2, $3, NOW() + INTERVAL '30 days')
        "#,
    )
    .bind(user_id)
    .bind(plan_id)
    .bind(payment_id)
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn approval_on_a_full_pool_reports_no_capacity(pool: PgPool) {
    let svc = service(&pool, "netflix").await;
    let ls = login_service(&pool, svc, 1, 1).await;
    let alice = user(&pool, "alice@example.com").await;
    let request = pending(&pool, alice, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    let outcome = repo.activate(request, None).await.unwrap().unwrap();

    assert!(matches!(outcome, Activation::NoCapacity));
    assert_eq!(current_users(&pool, ls).await, 1);
    let status: String = sqlx::query_scalar("SELECT status FROM user_services WHERE id = $1")
        .bind(request)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "pending");
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_approvals_share_a_roomy_pool(pool: PgPool) {
    let svc = service(&pool, "spotify").await;
    let ls = login_service(&pool, svc, 5, 0).await;
    let a = pending(&pool, user(&pool, "a@example.com").await, svc).await;
    let b = pending(&pool, user(&pool, "b@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    let (first, second) = tokio::join!(repo.activate(a, None), repo.activate(b, None));

    assert!(matches!(first.unwrap().unwrap(), Activation::Activated { .. }));
    assert!(matches!(second.unwrap().unwrap(), Activation::Activated { .. }));
    assert_eq!(current_users(&pool, ls).await, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_approvals_for_the_last_slot_admit_one(pool: PgPool) {
    let svc = service(&pool, "hulu").await;
    let ls = login_service(&pool, svc, 1, 0).await;
    let a = pending(&pool, user(&pool, "a@example.com").await, svc).await;
    let b = pending(&pool, user(&pool, "b@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    let (first, second) = tokio::join!(repo.activate(a, None), repo.activate(b, None));
    let outcomes = [first.unwrap().unwrap(), second.unwrap().unwrap()];

    let activated = outcomes
        .iter()
        .filter(|o| matches!(o, Activation::Activated { .. }))
        .count();
    let refused = outcomes
        .iter()
        .filter(|o| matches!(o, Activation::NoCapacity))
        .count();
    assert_eq!((activated, refused), (1, 1));
    assert_eq!(current_users(&pool, ls).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn approval_moves_on_to_another_login_service_with_room(pool: PgPool) {
    let svc = service(&pool, "disney").await;
    let full = login_service(&pool, svc, 2, 2).await;
    let roomy = login_service(&pool, svc, 2, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    match repo.activate(request, None).await.unwrap().unwrap() {
        Activation::Activated { login_service, .. } => assert_eq!(login_service.id, roomy),
        other => panic!("expected activation, got {other:?}"),
    }
    assert_eq!(current_users(&pool, full).await, 2);
    assert_eq!(current_users(&pool, roomy).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn release_frees_the_slot_exactly_once(pool: PgPool) {
    let svc = service(&pool, "hbo").await;
    let ls = login_service(&pool, svc, 3, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    repo.activate(request, None).await.unwrap().unwrap();
    assert_eq!(current_users(&pool, ls).await, 1);

    let released = repo.release(request, UserServiceStatus::Inactive).await.unwrap().unwrap();
    match released {
        Release::Released {
            assignment,
            freed_login_service,
        } => {
            assert_eq!(assignment.status, UserServiceStatus::Inactive);
            assert_eq!(freed_login_service, Some(ls));
        }
        other => panic!("expected release, got {other:?}"),
    }
    assert_eq!(current_users(&pool, ls).await, 0);

    let again = repo.release(request, UserServiceStatus::Inactive).await.unwrap().unwrap();
    assert!(matches!(again, Release::InvalidState(UserServiceStatus::Inactive)));
    assert_eq!(current_users(&pool, ls).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn counter_never_drops_below_zero(pool: PgPool) {
    let svc = service(&pool, "prime").await;
    let ls = login_service(&pool, svc, 3, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    repo.activate(request, None).await.unwrap().unwrap();
    sqlx::query("UPDATE login_services SET current_users = 0 WHERE id = $1")
        .bind(ls)
        .execute(&pool)
        .await
        .unwrap();

    repo.release(request, UserServiceStatus::Suspended).await.unwrap().unwrap();
    assert_eq!(current_users(&pool, ls).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn reconcile_restores_counts_from_active_assignments(pool: PgPool) {
    let svc = service(&pool, "crunchyroll").await;
    let ls = login_service(&pool, svc, 5, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    repo.activate(request, None).await.unwrap().unwrap();
    sqlx::query("UPDATE login_services SET current_users = 4 WHERE id = $1")
        .bind(ls)
        .execute(&pool)
        .await
        .unwrap();

    let fixed = LoginServiceRepository::new(pool.clone()).reconcile_usage().await.unwrap();
    assert_eq!(fixed, 1);
    assert_eq!(current_users(&pool, ls).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn unentitled_assignments_are_released_with_their_cookies(pool: PgPool) {
    let svc = service(&pool, "youtube").await;
    let ls = login_service(&pool, svc, 2, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    repo.activate(request, None).await.unwrap().unwrap();
    let cookies = CookieRepository::new(pool.clone());
    let ids = cookies
        .create_for_assignments(&[request], &serde_json::json!({ "sid": "abc" }), Some("abc"), chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    // No subscription backs the assignment.
    assert_eq!(repo.release_unentitled(None).await.unwrap(), 1);
    assert_eq!(current_users(&pool, ls).await, 0);
    let cookie = cookies.get_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(cookie.status, CookieStatus::Invalid);
}

#[sqlx::test(migrations = "./migrations")]
async fn validation_never_revives_a_released_cookie(pool: PgPool) {
    let svc = service(&pool, "paramount").await;
    login_service(&pool, svc, 2, 0).await;
    let request = pending(&pool, user(&pool, "a@example.com").await, svc).await;

    let repo = UserServiceRepository::new(pool.clone());
    repo.activate(request, None).await.unwrap().unwrap();
    let cookies = CookieRepository::new(pool.clone());
    let ids = cookies
        .create_for_assignments(&[request], &serde_json::json!({ "sid": "abc" }), Some("abc"), chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    let checks = cookies.pending_checks(Some(&ids)).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert!(checks[0].assignment_active);

    // The assignment is released between reading and applying the checks.
    repo.release(request, UserServiceStatus::Inactive).await.unwrap().unwrap();
    assert_eq!(cookies.apply_validation(&ids, CookieStatus::Valid).await.unwrap(), 0);

    let cookie = cookies.get_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(cookie.status, CookieStatus::Invalid);
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_requests_respect_the_allowance(pool: PgPool) {
    let alice = user(&pool, "alice@example.com").await;
    subscribe(&pool, alice, 1).await;
    let netflix = service(&pool, "netflix").await;
    let spotify = service(&pool, "spotify").await;

    let repo = UserServiceRepository::new(pool.clone());
    let (first, second) = tokio::join!(repo.request(alice, netflix), repo.request(alice, spotify));
    let outcomes = [first.unwrap(), second.unwrap()];

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::Created(_)))
        .count();
    let limited = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::LimitReached(1)))
        .count();
    assert_eq!((created, limited), (1, 1));

    let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_services WHERE user_id = $1")
        .bind(alice)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(held, 1);
}
