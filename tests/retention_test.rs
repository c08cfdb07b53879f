//! Retention Sweeping
//!
//! The sweeper removes delivered rows past the delivered window and
//! undelivered rows past the undelivered window, and touches nothing inside
//! either window.

mod common;

use rusqlite::params;
use spool::{current_time_ms, store, MessageId, NewMessage, Spool};

/// Three rows: delivered two hours ago, created 25 hours ago undelivered,
/// created five minutes ago undelivered. With the default windows (1 h
/// delivered, 24 h undelivered) only the five-minute row survives a sweep.
#[tokio::test]
async fn sweep_with_default_windows() {
    let (_dir, path) = common::create_temp_db_file("retention_defaults.db");

    let now = current_time_ms();
    let two_hours_ago = now - 2 * 3_600 * 1_000;
    let twenty_five_hours_ago = now - 25 * 3_600 * 1_000;
    let five_minutes_ago = now - 5 * 60 * 1_000;

    {
        let conn = common::open_read_write(&path);
        store::insert_batch(
            &conn,
            &[
                NewMessage::new("s", "message", "old-delivered"),
                NewMessage::new("s", "message", "old-undelivered"),
                NewMessage::new("s", "message", "fresh"),
            ],
        )
        .unwrap();

        conn.execute(
            "UPDATE messages SET created_ms = ?, delivered_ms = ? WHERE data = 'old-delivered'",
            params![two_hours_ago as i64, two_hours_ago as i64],
        )
        .unwrap();
        conn.execute(
            "UPDATE messages SET created_ms = ? WHERE data = 'old-undelivered'",
            params![twenty_five_hours_ago as i64],
        )
        .unwrap();
        conn.execute(
            "UPDATE messages SET created_ms = ? WHERE data = 'fresh'",
            params![five_minutes_ago as i64],
        )
        .unwrap();
    }

    // Default retention windows; fast intervals are irrelevant here.
    let spool = Spool::open(&path, common::test_config()).unwrap();
    let report = spool.sweeper().run().await.unwrap();

    assert_eq!(report.delivered_removed, 1);
    assert_eq!(report.undelivered_removed, 1);

    let survivors = spool.backlog("s", MessageId::NONE, 100).await.unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].data, "fresh");

    spool.shutdown().await.unwrap();
}

/// Rows inside both windows are untouched, and running the sweeper again
/// right away removes nothing.
#[tokio::test]
async fn sweep_is_idempotent_and_window_safe() {
    let (_dir, path) = common::create_temp_db_file("retention_idempotent.db");
    let spool = Spool::open(&path, common::test_config()).unwrap();

    spool.broadcast("s", "message", "recent-undelivered");
    spool.broadcast("s", "message", "recent-delivered");
    spool.flush().await.unwrap();

    // Deliver one of them just now: inside the delivered window.
    {
        let conn = common::open_read_write(&path);
        let id: i64 = conn
            .query_row(
                "SELECT id FROM messages WHERE data = 'recent-delivered'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        store::mark_delivered(&conn, &[MessageId::from_raw(id)], current_time_ms()).unwrap();
    }

    let first = spool.sweeper().run().await.unwrap();
    assert_eq!(first.delivered_removed, 0);
    assert_eq!(first.undelivered_removed, 0);

    let second = spool.sweeper().run().await.unwrap();
    assert_eq!(second.delivered_removed, 0);
    assert_eq!(second.undelivered_removed, 0);

    let conn = common::open_read_only(&path);
    assert_eq!(common::count_all(&conn), 2);

    spool.shutdown().await.unwrap();
}

/// Ids keep increasing after a sweep removed earlier rows: resume cursors
/// held by clients can never collide with new messages.
#[tokio::test]
async fn ids_stay_monotonic_across_sweeps() {
    let (_dir, path) = common::create_temp_db_file("retention_monotonic.db");
    let spool = Spool::open(&path, common::test_config()).unwrap();

    spool.broadcast("s", "message", "first");
    spool.flush().await.unwrap();
    let before = spool.backlog("s", MessageId::NONE, 100).await.unwrap();
    let first_id = before[0].id;

    // Age the row out of the undelivered window and sweep it away.
    {
        let conn = common::open_read_write(&path);
        let cutoff = current_time_ms() - 25 * 3_600 * 1_000;
        conn.execute(
            "UPDATE messages SET created_ms = ?",
            params![cutoff as i64],
        )
        .unwrap();
    }
    let report = spool.sweeper().run().await.unwrap();
    assert_eq!(report.undelivered_removed, 1);

    spool.broadcast("s", "message", "second");
    spool.flush().await.unwrap();
    let after = spool.backlog("s", MessageId::NONE, 100).await.unwrap();
    assert_eq!(after.len(), 1);
    assert!(after[0].id > first_id, "ids are never reused");

    spool.shutdown().await.unwrap();
}
