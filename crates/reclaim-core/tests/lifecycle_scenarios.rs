use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reclaim_core::monitor::ManualMemoryProbe;
use reclaim_core::pool::{PoolConfig, RequestHandleInit};
use reclaim_core::{
    Component, ComponentDefinition, ComponentPriority, LifecycleConfig, LifecycleContext,
    LifecycleError, ObjectPool, PressureLevel, RequestHandle, SessionState, Teardown,
};

struct Named(&'static str);

#[async_trait]
impl Component for Named {}

fn context_at(percentage: f64) -> (LifecycleContext, Arc<ManualMemoryProbe>) {
    let probe = Arc::new(ManualMemoryProbe::at_percentage(percentage));
    let context = LifecycleContext::new(LifecycleConfig::default(), probe.clone())
        .expect("default config is valid");
    (context, probe)
}

#[tokio::test]
async fn expensive_optional_component_is_deferred_at_95_percent() {
    let (context, probe) = context_at(95.0);
    context.registry().register(
        ComponentDefinition::new("cache", || Ok(Named("cache")))
            .with_priority(ComponentPriority::Optional)
            .with_memory_cost(10.0),
    );

    let outcome = context.registry().load("cache").await.unwrap();
    let deferred = outcome.deferred().expect("deferred under critical pressure");
    assert_eq!(deferred.pressure, PressureLevel::Critical);
    assert!(!context.registry().is_loaded("cache"));

    probe.set_percentage(50.0);
    assert!(context.registry().load("cache").await.unwrap().is_ready());
}

#[tokio::test]
async fn dependency_is_constructed_before_dependent() {
    let (context, _probe) = context_at(20.0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    context.registry().register(
        ComponentDefinition::new("A", move || {
            log.lock().push("A");
            Ok(Named("A"))
        })
        .depends_on("B"),
    );
    let log = order.clone();
    context.registry().register(ComponentDefinition::new("B", move || {
        log.lock().push("B");
        Ok(Named("B"))
    }));

    let a = context
        .registry()
        .load_as::<Named>("A")
        .await
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(a.0, "A");
    assert_eq!(*order.lock(), vec!["B", "A"]);
    assert!(context.registry().is_loaded("B"));
}

#[tokio::test]
async fn pool_hits_then_misses_then_overflows() {
    let pool: ObjectPool<RequestHandle> = ObjectPool::new(PoolConfig {
        name: "scenario".to_string(),
        initial_size: 2,
        max_size: 3,
        reuse_timeout: Duration::from_secs(60),
    });

    let first = pool.acquire(RequestHandleInit::new("r1").with_session("s1"));
    let second = pool.acquire(RequestHandleInit::new("r2"));
    assert_eq!(pool.stats().cache_hit_rate, 1.0);

    let third = pool.acquire(RequestHandleInit::new("r3"));
    assert_eq!(pool.stats().current_active, 3);
    assert!(!third.is_overflow());

    let overflow = pool.acquire(RequestHandleInit::new("r4").with_user("u"));
    assert!(overflow.is_overflow());
    assert_eq!(overflow.request_id, "r4");
    assert_eq!(first.session_id.as_deref(), Some("s1"));

    drop(overflow);
    let stats = pool.stats();
    assert_eq!(stats.current_pooled, 0, "overflow handles are never pooled");
    assert!(stats.current_active + stats.current_pooled <= 3);

    drop((first, second, third));
    let stats = pool.stats();
    assert_eq!(stats.current_active, 0);
    assert_eq!(stats.current_pooled, 3);

    let recycled = pool.acquire(RequestHandleInit::new("r5"));
    assert_eq!(recycled.request_id, "r5");
    assert!(recycled.session_id.is_none());
}

#[tokio::test]
async fn disposing_a_session_tears_down_its_resources() {
    let (context, _probe) = context_at(20.0);
    let sessions = context.sessions();
    let torn_down = Arc::new(AtomicUsize::new(0));

    let session = sessions
        .create_session("S", "user-1", Some("thread-1".to_string()), Some("ws-1".to_string()))
        .await;
    let counter = torn_down.clone();
    assert!(
        sessions
            .register_resource(
                "S",
                "R",
                "tool-state",
                Arc::new(vec![1u8, 2, 3]),
                Some(Teardown::sync("R", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                5,
            )
            .await
    );
    assert_eq!(sessions.stats().memory_usage, 5);

    assert!(sessions.dispose_session("S").await);
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Disposed);
    assert!(sessions.get("S").is_none());
    assert!(sessions.session_for_channel("ws-1").is_none());
    assert!(sessions.sessions_for_user("user-1").is_empty());

    assert!(!sessions.dispose_session("S").await);
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scopes_of_the_same_owner_do_not_share_components() {
    let (context, _probe) = context_at(20.0);
    let scopes = context.scopes();
    let built = Arc::new(AtomicUsize::new(0));

    let first = scopes.open_scope("req-1", "owner", None);
    let second = scopes.open_scope("req-2", "owner", None);

    let counter = built.clone();
    let x1 = first
        .get_or_create(
            "x",
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("x"))
            },
            None,
        )
        .unwrap();
    let counter = built.clone();
    let x2 = second
        .get_or_create(
            "x",
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("x"))
            },
            None,
        )
        .unwrap();

    assert!(!Arc::ptr_eq(&x1, &x2));
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(scopes.active_count(), 2);

    let scope = first.scope();
    first.close().await;
    second.close().await;
    assert_eq!(scopes.active_count(), 0);
    assert!(matches!(
        scope.get_or_create("x", || Ok(String::new()), None),
        Err(LifecycleError::Disposed { .. })
    ));
}

#[tokio::test]
async fn full_lifecycle_start_to_shutdown() {
    let probe = Arc::new(ManualMemoryProbe::at_percentage(30.0));
    let config = LifecycleConfig::from_toml_str(
        r#"
        sample_interval_seconds = 0.02
        cleanup_interval_seconds = 0.05
        preload_delay_seconds = 0
        pool_initial_size = 1
        pool_max_size = 4
        "#,
    )
    .unwrap();
    let context = LifecycleContext::new(config, probe.clone()).unwrap();
    context.registry().register(
        ComponentDefinition::new("optional", || Ok(Named("optional")))
            .with_priority(ComponentPriority::Low),
    );

    context.start().await;
    context.registry().load("optional").await.unwrap();
    context.sessions().create_session("s", "u", None, None).await;

    let value = context
        .scopes()
        .with_scope("req", "u", None, |scope| async move {
            let handle = scope.get_or_create("n", || Ok(41u32), None)?;
            Ok::<_, LifecycleError>(*handle + 1)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);

    // The background sampler picks up the spike and the listener sheds load.
    probe.set_percentage(92.0);
    for _ in 0..200 {
        if !context.registry().is_loaded("optional") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!context.registry().is_loaded("optional"));
    assert!(
        context
            .monitor()
            .latest()
            .is_some_and(|stats| stats.pressure_level == PressureLevel::Critical)
    );

    let report = tokio::time::timeout(Duration::from_secs(5), context.shutdown())
        .await
        .expect("shutdown completes");
    assert_eq!(report.sessions, 1);
    assert_eq!(context.sessions().count(), 0);
    assert_eq!(context.scopes().active_count(), 0);
}
