use crate::helpers::{dispatcher, Explode, Gate, Hold, Sever, WhoAmI};
use carrot_courier::dispatcher::{ClientCommand, DispatchOptions};
use carrot_courier::DispatchError;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn at_most_channels_count_commands_run_at_the_same_time() {
    // Arrange
    let (dispatcher, ledger) = dispatcher(3);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::with_publisher_confirms();

    // Act
    let calls = (0..12).map(|_| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .invoke(
                    Hold {
                        duration: Duration::from_millis(10),
                    },
                    options,
                    &CancellationToken::new(),
                )
                .await
        })
    });
    let ids: HashSet<usize> = join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    // Assert
    assert_eq!(3, ledger.max_concurrency.load(Ordering::SeqCst));
    assert_eq!(3, ids.len());
    assert_eq!(3, ledger.opened.load(Ordering::SeqCst));
    assert_eq!(Some(3), dispatcher.available_channels(options));
}

#[tokio::test]
async fn equal_options_share_a_pool_and_different_options_do_not() {
    let (dispatcher, _) = dispatcher(1);
    let token = CancellationToken::new();

    let first = dispatcher
        .invoke(WhoAmI, DispatchOptions { publisher_confirms: true }, &token)
        .await
        .unwrap();
    let second = dispatcher
        .invoke(WhoAmI, DispatchOptions::with_publisher_confirms(), &token)
        .await
        .unwrap();
    let other = dispatcher
        .invoke(WhoAmI, DispatchOptions::without_publisher_confirms(), &token)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(2, dispatcher.pool_count());
}

#[tokio::test]
async fn concurrent_first_use_creates_a_single_pool() {
    let (dispatcher, ledger) = dispatcher(2);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::without_publisher_confirms();

    let calls = (0..20).map(|_| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .invoke(WhoAmI, options, &CancellationToken::new())
                .await
        })
    });
    for call in join_all(calls).await {
        call.unwrap().unwrap();
    }

    assert_eq!(1, dispatcher.pool_count());
    assert!(ledger.opened.load(Ordering::SeqCst) <= 2);
    assert_eq!(Some(2), dispatcher.available_channels(options));
}

#[tokio::test]
async fn with_a_single_channel_commands_run_one_after_the_other() {
    // Arrange
    let (dispatcher, _) = dispatcher(1);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::with_publisher_confirms();
    let (first_started, first_release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let (second_started, second_release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));

    // Act
    let first = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let gate = Gate {
            started: first_started.clone(),
            release: first_release.clone(),
        };
        async move { dispatcher.invoke(gate, options, &CancellationToken::new()).await }
    });
    first_started.notified().await;
    let second = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let gate = Gate {
            started: second_started.clone(),
            release: second_release.clone(),
        };
        async move { dispatcher.invoke(gate, options, &CancellationToken::new()).await }
    });

    // Assert
    let started_early =
        tokio::time::timeout(Duration::from_millis(50), second_started.notified()).await;
    assert!(started_early.is_err(), "the second command started too early");

    first_release.notify_one();
    first.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), second_started.notified())
        .await
        .expect("the second command never started");
    second_release.notify_one();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelling_a_waiting_caller_leaves_the_pool_untouched() {
    // Arrange
    let (dispatcher, _) = dispatcher(1);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::without_publisher_confirms();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let holder = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let gate = Gate {
            started: started.clone(),
            release: release.clone(),
        };
        async move { dispatcher.invoke(gate, options, &CancellationToken::new()).await }
    });
    started.notified().await;
    assert_eq!(Some(0), dispatcher.available_channels(options));

    // Act
    let token = CancellationToken::new();
    let waiter = tokio::spawn({
        let (dispatcher, token) = (dispatcher.clone(), token.clone());
        async move { dispatcher.invoke(WhoAmI, options, &token).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    // Assert
    assert!(matches!(
        waiter.await.unwrap(),
        Err(DispatchError::Cancelled)
    ));
    assert_eq!(Some(0), dispatcher.available_channels(options));
    release.notify_one();
    holder.await.unwrap().unwrap();
    assert_eq!(Some(1), dispatcher.available_channels(options));
}

#[tokio::test]
async fn a_failing_command_returns_its_channel_to_the_pool() {
    let (dispatcher, ledger) = dispatcher(1);
    let options = DispatchOptions::with_publisher_confirms();
    let token = CancellationToken::new();

    let result = dispatcher.invoke(Explode, options, &token).await;

    match result {
        Err(DispatchError::CommandFailed(e)) => assert_eq!("the broker said no", e.to_string()),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(Some(1), dispatcher.available_channels(options));
    dispatcher.invoke(WhoAmI, options, &token).await.unwrap();
    assert_eq!(1, ledger.opened.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancelling_a_running_command_returns_its_channel_to_the_pool() {
    let (dispatcher, _) = dispatcher(1);
    let options = DispatchOptions::with_publisher_confirms();
    let token = CancellationToken::new();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));

    let invocation = dispatcher.invoke(Gate { started: started.clone(), release }, options, &token);
    let (result, _) = tokio::join!(invocation, async {
        started.notified().await;
        token.cancel();
    });

    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert_eq!(Some(1), dispatcher.available_channels(options));
}

#[tokio::test]
async fn dropping_a_running_invocation_returns_its_channel_to_the_pool() {
    let (dispatcher, _) = dispatcher(1);
    let options = DispatchOptions::with_publisher_confirms();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        dispatcher.invoke(Gate { started, release }, options, &CancellationToken::new()),
    )
    .await;

    assert!(timed_out.is_err());
    assert_eq!(Some(1), dispatcher.available_channels(options));
}

#[tokio::test]
async fn a_broken_channel_is_recreated_transparently() {
    let (dispatcher, ledger) = dispatcher(1);
    let options = DispatchOptions::without_publisher_confirms();
    let token = CancellationToken::new();

    let severed = dispatcher.invoke(Sever, options, &token).await.unwrap();
    let next = dispatcher.invoke(WhoAmI, options, &token).await.unwrap();

    assert_ne!(severed, next);
    assert_eq!(2, ledger.opened.load(Ordering::SeqCst));
    assert_eq!(Some(1), dispatcher.available_channels(options));
}

#[tokio::test]
async fn channels_honour_the_publisher_confirms_option() {
    struct Confirms;

    #[async_trait::async_trait]
    impl ClientCommand<crate::helpers::MockChannel> for Confirms {
        type Output = bool;

        async fn invoke(self, channel: &crate::helpers::MockChannel) -> Result<bool, anyhow::Error> {
            Ok(channel.publisher_confirms)
        }
    }

    let (dispatcher, _) = dispatcher(2);
    let token = CancellationToken::new();

    assert!(dispatcher
        .invoke(Confirms, DispatchOptions::with_publisher_confirms(), &token)
        .await
        .unwrap());
    assert!(!dispatcher
        .invoke(Confirms, DispatchOptions::without_publisher_confirms(), &token)
        .await
        .unwrap());
}

#[tokio::test]
async fn dispose_closes_every_channel_exactly_once() {
    // Arrange
    let (dispatcher, ledger) = dispatcher(2);
    let dispatcher = Arc::new(dispatcher);
    let token = CancellationToken::new();
    // Open both channels of both pools.
    for options in [
        DispatchOptions::with_publisher_confirms(),
        DispatchOptions::without_publisher_confirms(),
    ] {
        let calls = (0..2).map(|_| {
            dispatcher.invoke(
                Hold {
                    duration: Duration::from_millis(5),
                },
                options,
                &token,
            )
        });
        for result in join_all(calls).await {
            result.unwrap();
        }
    }
    assert_eq!(4, ledger.opened.load(Ordering::SeqCst));

    // Act
    dispatcher.dispose().await;

    // Assert
    let mut closed = ledger.closed_ids();
    closed.sort_unstable();
    assert_eq!(vec![0, 1, 2, 3], closed);
    assert!(dispatcher.is_disposed());
    assert!(matches!(
        dispatcher
            .invoke(WhoAmI, DispatchOptions::with_publisher_confirms(), &token)
            .await,
        Err(DispatchError::Disposed)
    ));
    assert!(matches!(
        dispatcher
            .invoke(WhoAmI, DispatchOptions { publisher_confirms: false }, &token)
            .await,
        Err(DispatchError::Disposed)
    ));
    dispatcher.dispose().await;
    assert_eq!(4, ledger.closed_ids().len());
}

#[tokio::test]
async fn channels_checked_out_during_dispose_are_closed_by_their_command() {
    // Arrange
    let (dispatcher, ledger) = dispatcher(1);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::with_publisher_confirms();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let in_flight = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let gate = Gate {
            started: started.clone(),
            release: release.clone(),
        };
        async move { dispatcher.invoke(gate, options, &CancellationToken::new()).await }
    });
    started.notified().await;

    // Act
    dispatcher.dispose().await;
    assert!(ledger.closed_ids().is_empty());
    release.notify_one();

    // Assert
    in_flight.await.unwrap().unwrap();
    assert_eq!(vec![0], ledger.closed_ids());
}

#[tokio::test]
async fn a_channel_handed_to_a_caller_that_gives_up_after_dispose_is_closed() {
    // Arrange
    let (dispatcher, ledger) = dispatcher(1);
    let dispatcher = Arc::new(dispatcher);
    let options = DispatchOptions::with_publisher_confirms();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let holder = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let gate = Gate {
            started: started.clone(),
            release: release.clone(),
        };
        async move { dispatcher.invoke(gate, options, &CancellationToken::new()).await }
    });
    started.notified().await;

    let waiter_token = CancellationToken::new();
    let mut waiter = Box::pin(dispatcher.invoke(WhoAmI, options, &waiter_token));
    assert!(futures_util::poll!(&mut waiter).is_pending());

    // The returned channel goes straight to the waiting caller.
    release.notify_one();
    holder.await.unwrap().unwrap();

    // Act
    dispatcher.dispose().await;
    assert!(ledger.closed_ids().is_empty());
    waiter_token.cancel();

    // Assert
    assert!(matches!(waiter.await, Err(DispatchError::Cancelled)));
    tokio::time::timeout(Duration::from_secs(1), async {
        while ledger.closed_ids().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("the orphaned channel was never closed");
    assert_eq!(vec![0], ledger.closed_ids());
    assert_eq!(1, ledger.opened.load(Ordering::SeqCst));
}
