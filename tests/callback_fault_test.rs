//! Callback Fault Isolation
//!
//! A broken listener must not stall a session: when one callback panics on
//! every message, the other callbacks still see the full stream, the cursor
//! still advances, and rows are still marked delivered.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spool::{MessageCallback, Spool};

#[tokio::test]
async fn panicking_callback_does_not_block_others() {
    let (_dir, path) = common::create_temp_db_file("callback_fault.db");
    let spool = Spool::open(&path, common::test_config()).unwrap();

    // Keep the panic output out of the test log; the engine catches these.
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));

    let faulty_invocations = Arc::new(AtomicUsize::new(0));
    let f = faulty_invocations.clone();
    let faulty: MessageCallback = Box::new(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
        panic!("listener bug");
    });
    spool.subscribe("s", faulty).await;

    let (received, healthy) = common::collector();
    spool.subscribe("s", healthy).await;

    for n in 0..5 {
        assert!(spool.broadcast("s", "message", format!("{n}")));
    }
    spool.flush().await.unwrap();

    // The healthy callback sees every message.
    common::eventually(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || (common::collected_len(&received) == 5).then_some(()),
    )
    .await;
    assert_eq!(
        common::collected_data(&received),
        vec!["0", "1", "2", "3", "4"]
    );

    // The faulty one was attempted for every message too.
    assert_eq!(faulty_invocations.load(Ordering::SeqCst), 5);

    // And delivery marking was not derailed.
    common::eventually(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || {
            let conn = common::open_read_only(&path);
            (common::count_undelivered(&conn) == 0).then_some(())
        },
    )
    .await;

    std::panic::set_hook(previous_hook);
    spool.shutdown().await.unwrap();
}

/// A panicking callback does not poison later messages either: delivery
/// keeps flowing across multiple poll cycles.
#[tokio::test]
async fn delivery_continues_after_repeated_panics() {
    let (_dir, path) = common::create_temp_db_file("callback_fault_repeat.db");
    let spool = Spool::open(&path, common::test_config()).unwrap();

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));

    let faulty: MessageCallback = Box::new(|_| panic!("always broken"));
    spool.subscribe("s", faulty).await;

    let (received, healthy) = common::collector();
    spool.subscribe("s", healthy).await;

    for wave in 0..3 {
        spool.broadcast("s", "message", format!("wave-{wave}"));
        spool.flush().await.unwrap();
        common::eventually(
            Duration::from_secs(5),
            Duration::from_millis(10),
            || (common::collected_len(&received) == wave + 1).then_some(()),
        )
        .await;
    }

    assert_eq!(
        common::collected_data(&received),
        vec!["wave-0", "wave-1", "wave-2"]
    );

    std::panic::set_hook(previous_hook);
    spool.shutdown().await.unwrap();
}
