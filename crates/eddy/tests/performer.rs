use std::{
    sync::{
        Arc, Mutex, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use eddy::{Backend, PerformError, Performer, Reactor, ReactorConfig, Stopper, timing::Duration};

/// Boots a reactor on its own thread and hands back a performer into it.
fn spawn_reactor(backend: Backend) -> (Performer, Stopper, thread::ThreadId, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let config = ReactorConfig {
            backend,
            max_sleep: Duration::from_millis(50),
            ..Default::default()
        };
        let reactor = Reactor::with_config(config).unwrap();
        let performer = Performer::new(&reactor).unwrap();
        tx.send((performer, reactor.stopper(), thread::current().id())).unwrap();
        reactor.run().unwrap();
    });
    let (performer, stopper, tid) = rx.recv().unwrap();
    (performer, stopper, tid, join)
}

fn tasks_run_on_the_reactor_thread(backend: Backend) {
    let (performer, stopper, reactor_tid, join) = spawn_reactor(backend);

    let observed = Arc::new(Mutex::new(None));
    let inner = observed.clone();
    performer
        .perform_sync(move || {
            *inner.lock().unwrap() = Some(thread::current().id());
        })
        .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(reactor_tid));

    stopper.stop();
    performer.perform(|| {}).unwrap();
    join.join().unwrap();
}

#[test]
fn tasks_run_on_the_reactor_thread_epoll() {
    tasks_run_on_the_reactor_thread(Backend::Epoll);
}

#[test]
fn tasks_run_on_the_reactor_thread_select() {
    tasks_run_on_the_reactor_thread(Backend::Select);
}

#[test]
fn fifo_holds_across_async_and_sync_enqueues() {
    let (performer, stopper, _, join) = spawn_reactor(Backend::Epoll);

    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20u32 {
        let log = log.clone();
        performer.perform(move || log.lock().unwrap().push(i)).unwrap();
    }
    let sync_log = log.clone();
    performer.perform_sync(move || sync_log.lock().unwrap().push(100)).unwrap();

    let log = log.lock().unwrap();
    let mut expected: Vec<u32> = (0..20).collect();
    expected.push(100);
    assert_eq!(*log, expected);

    stopper.stop();
    join.join().unwrap();
}

#[test]
fn perform_sync_is_inline_on_the_reactor_thread() {
    let (performer, stopper, _, join) = spawn_reactor(Backend::Epoll);

    // The nested call runs inline; anything else would deadlock here.
    let nested = performer.clone();
    let ran = Arc::new(AtomicUsize::new(0));
    let observed = ran.clone();
    performer
        .perform_sync(move || {
            let observed = observed.clone();
            nested
                .perform_sync(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);

    stopper.stop();
    join.join().unwrap();
}

#[test]
fn close_runs_every_queued_task_exactly_once() {
    let (performer, stopper, _, join) = spawn_reactor(Backend::Epoll);

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let counter = counter.clone();
        performer.perform(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }

    let (done_tx, done_rx) = mpsc::channel();
    let closer = performer.clone();
    performer
        .perform(move || {
            closer.close();
            done_tx.send(()).unwrap();
        })
        .unwrap();
    done_rx.recv().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 50);
    assert!(performer.is_closed());
    assert!(matches!(performer.perform(|| {}), Err(PerformError::Closed)));
    assert!(matches!(performer.perform_sync(|| {}), Err(PerformError::Closed)));

    // The pipe is gone, so the stop is noticed at the next max_sleep tick.
    stopper.stop();
    join.join().unwrap();
}

#[test]
fn coalesced_wakes_deliver_every_task_from_many_threads() {
    let (performer, stopper, _, join) = spawn_reactor(Backend::Epoll);

    let counter = Arc::new(AtomicUsize::new(0));
    let mut producers = Vec::new();
    for _ in 0..4 {
        let performer = performer.clone();
        let counter = counter.clone();
        producers.push(thread::spawn(move || {
            for _ in 0..1000 {
                let counter = counter.clone();
                performer
                    .perform(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    // A sync barrier: everything enqueued before it has run by the time it
    // returns.
    performer.perform_sync(|| {}).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4000);

    stopper.stop();
    performer.perform(|| {}).unwrap();
    join.join().unwrap();
}
