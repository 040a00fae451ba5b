use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use routekeeper_agent::runtime::{Provider, Registration, Runtime, RuntimeError, RuntimeState};
use routekeeper_events::{Event, EventKind, InterfaceRemove};

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

struct Alpha {
    journal: Journal,
}

struct Beta {
    journal: Journal,
}

struct Gamma {
    journal: Journal,
    greeting: String,
}

#[async_trait]
impl Provider for Alpha {
    async fn start(&self) -> anyhow::Result<()> {
        note(&self.journal, "start alpha");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        note(&self.journal, "stop alpha");
        Ok(())
    }
}

#[async_trait]
impl Provider for Beta {
    async fn start(&self) -> anyhow::Result<()> {
        note(&self.journal, "start beta");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        note(&self.journal, "stop beta");
        Ok(())
    }
}

#[async_trait]
impl Provider for Gamma {
    async fn start(&self) -> anyhow::Result<()> {
        note(&self.journal, format!("start gamma {}", self.greeting));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        note(&self.journal, "stop gamma");
        Ok(())
    }
}

fn chain(journal: &Journal) -> Vec<Registration> {
    let (a, b, c) = (journal.clone(), journal.clone(), journal.clone());
    vec![
        Registration::new(move |injector| {
            let _beta: Arc<Beta> = injector.get("beta")?;
            Ok(Gamma {
                journal: c,
                greeting: injector.kwarg::<String>("greeting")?.unwrap_or_default(),
            })
        })
        .depends_on::<Beta>("beta")
        .with_kwarg("greeting", "hello"),
        Registration::new(move |injector| {
            let _alpha: Arc<Alpha> = injector.get("alpha")?;
            Ok(Beta { journal: b })
        })
        .depends_on::<Alpha>("alpha"),
        Registration::new(move |_| Ok(Alpha { journal: a })),
    ]
}

#[tokio::test]
async fn test_load_order_follows_dependencies() {
    let journal = Journal::default();
    let mut runtime = Runtime::new();
    for registration in chain(&journal) {
        runtime.register(registration).unwrap();
    }

    runtime.load().unwrap();
    assert_eq!(runtime.state(), RuntimeState::Loaded);
    assert_eq!(runtime.load_order(), vec!["Alpha", "Beta", "Gamma"]);
    assert!(runtime.provider::<Gamma>().is_some());
}

#[tokio::test]
async fn test_dependency_loop_is_reported() {
    let journal = Journal::default();
    let (a, b) = (journal.clone(), journal.clone());

    let mut runtime = Runtime::new();
    runtime
        .register(Registration::new(move |_| Ok(Alpha { journal: a })).depends_on::<Beta>("beta"))
        .unwrap();
    runtime
        .register(Registration::new(move |_| Ok(Beta { journal: b })).depends_on::<Alpha>("alpha"))
        .unwrap();

    match runtime.load() {
        Err(RuntimeError::DependencyLoop(names)) => {
            assert_eq!(names, vec!["Alpha".to_string(), "Beta".to_string()]);
        }
        other => panic!("expected a dependency loop, got {other:?}"),
    }
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_dependency_and_duplicates() {
    let journal = Journal::default();
    let (b, c) = (journal.clone(), journal.clone());

    let mut runtime = Runtime::new();
    runtime
        .register(Registration::new(move |_| Ok(Beta { journal: b })).depends_on::<Alpha>("alpha"))
        .unwrap();
    assert!(matches!(
        runtime.register(Registration::new(move |_| Ok(Beta { journal: c }))),
        Err(RuntimeError::DuplicateProvider(_))
    ));
    assert!(matches!(
        runtime.load(),
        Err(RuntimeError::DependencyMissing { .. })
    ));
    assert_eq!(runtime.state(), RuntimeState::Unloaded);
}

#[tokio::test]
async fn test_constructor_sees_only_declared_dependencies() {
    let journal = Journal::default();
    let (a, b) = (journal.clone(), journal.clone());

    let mut runtime = Runtime::new();
    runtime
        .register(Registration::new(move |_| Ok(Alpha { journal: a })))
        .unwrap();
    runtime
        .register(Registration::new(move |injector| {
            let _alpha: Arc<Alpha> = injector.get("alpha")?;
            Ok(Beta { journal: b })
        }))
        .unwrap();

    let error = runtime.load().unwrap_err();
    assert!(matches!(error, RuntimeError::Construct { .. }));
    assert!(error.to_string().contains("no dependency named alpha"));
}

#[tokio::test]
async fn test_lifecycle_hooks_and_dispatch() {
    let journal = Journal::default();
    let mut runtime = Runtime::new();
    for registration in chain(&journal) {
        runtime.register(registration).unwrap();
    }
    runtime.load().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let hub = runtime.hub();
    let seen = journal.clone();
    hub.subscribe(EventKind::InterfaceRemove, "test", move |event: Event| {
        let seen = seen.clone();
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if let Event::InterfaceRemove(remove) = event {
                note(&seen, format!("removed {}", remove.ifname));
            }
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    });

    runtime.start().await.unwrap();
    hub.publish(Event::InterfaceRemove(InterfaceRemove {
        ifindex: 7,
        ifname: "eth7".to_string(),
    }))
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), runtime.run(shutdown_rx))
        .await
        .expect("dispatch loop did not stop")
        .unwrap();
    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);

    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "start alpha",
            "start beta",
            "start gamma hello",
            "removed eth7",
            "stop gamma",
            "stop beta",
            "stop alpha",
        ]
    );
}

#[tokio::test]
async fn test_failed_start_stops_started_providers() {
    struct Broken;

    #[async_trait]
    impl Provider for Broken {
        async fn start(&self) -> anyhow::Result<()> {
            anyhow::bail!("no carrier")
        }
    }

    let journal = Journal::default();
    let a = journal.clone();
    let mut runtime = Runtime::new();
    runtime
        .register(Registration::new(move |_| Ok(Alpha { journal: a })))
        .unwrap();
    runtime
        .register(Registration::new(|_| Ok(Broken)).depends_on::<Alpha>("alpha"))
        .unwrap();
    runtime.load().unwrap();

    let error = runtime.start().await.unwrap_err();
    assert!(error.to_string().contains("no carrier"));
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(*journal.lock().unwrap(), vec!["start alpha", "stop alpha"]);
}

#[tokio::test]
async fn test_lifecycle_calls_out_of_order_are_rejected() {
    let journal = Journal::default();
    let mut runtime = Runtime::new();
    for registration in chain(&journal) {
        runtime.register(registration).unwrap();
    }

    assert!(matches!(
        runtime.start().await,
        Err(RuntimeError::InvalidState {
            operation: "start",
            state: RuntimeState::Unloaded,
        })
    ));

    runtime.load().unwrap();
    assert!(matches!(
        runtime.load(),
        Err(RuntimeError::InvalidState {
            operation: "load",
            state: RuntimeState::Loaded,
        })
    ));
    assert!(matches!(
        runtime.stop().await,
        Err(RuntimeError::InvalidState {
            operation: "stop",
            state: RuntimeState::Loaded,
        })
    ));
    let (_shutdown_tx, shutdown_rx) = watch::channel(true);
    assert!(matches!(
        runtime.run(shutdown_rx).await,
        Err(RuntimeError::InvalidState {
            operation: "run",
            state: RuntimeState::Loaded,
        })
    ));

    assert_eq!(runtime.state(), RuntimeState::Loaded);
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_second_run_is_refused() {
    let journal = Journal::default();
    let mut runtime = Runtime::new();
    for registration in chain(&journal) {
        runtime.register(registration).unwrap();
    }
    runtime.load().unwrap();
    runtime.start().await.unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(true);
    runtime.run(shutdown_rx.clone()).await.unwrap();
    assert!(matches!(
        runtime.run(shutdown_rx).await,
        Err(RuntimeError::AlreadyRunning)
    ));

    assert_eq!(runtime.state(), RuntimeState::Running);
    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}
