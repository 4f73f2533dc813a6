#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use errors::FieldError;
use field_modbus::transport::mock::{MockConnector, MockFailure, MockState};
use field_modbus::{
    BackoffPolicy, ConnectionKey, ConnectionPool, PoolConfig, Request, RequestOptions, Response,
};
use tokio::time::Instant;

fn pool_with(state: &Arc<MockState>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(Arc::new(MockConnector::new(Arc::clone(state))), config)
}

fn read(address: u16) -> Request {
    Request::ReadHoldingRegisters {
        address,
        quantity: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn requests_on_one_key_never_overlap() {
    let state = MockState::new();
    state.set_latency(Duration::from_millis(50));
    for addr in 0..20 {
        state.set_register("plc", 1, addr, addr * 10);
    }
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let calls = (0..20u16).map(|addr| {
        let pool = pool.clone();
        let key = key.clone();
        tokio::spawn(async move { pool.execute(&key, read(addr)).await })
    });
    let results = futures::future::join_all(calls).await;

    for (addr, result) in results.into_iter().enumerate() {
        let words = result.unwrap().unwrap().into_words().unwrap();
        assert_eq!(words, vec![addr as u16 * 10]);
    }

    assert_eq!(state.max_concurrency(&key), 1);
    let mut records = state.calls_for(&key);
    records.sort_by_key(|c| c.started);
    for pair in records.windows(2) {
        assert!(pair[0].finished.unwrap() < pair[1].started);
    }
    assert_eq!(state.connect_count(), 1);
    assert_eq!(pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_keys_run_in_parallel() {
    let state = MockState::new();
    state.set_latency(Duration::from_millis(100));
    let pool = pool_with(&state, PoolConfig::default());

    let start = Instant::now();
    let key_a = ConnectionKey::new("a", 502, 1);
    let key_b = ConnectionKey::new("b", 502, 1);
    let key_c = ConnectionKey::new("a", 502, 2);
    let a = pool.execute(&key_a, read(0));
    let b = pool.execute(&key_b, read(0));
    let c = pool.execute(&key_c, read(0));
    let (a, b, c) = tokio::join!(a, b, c);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert!(start.elapsed() < Duration::from_millis(150));
    assert_eq!(pool.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_faults_reconnect_with_backoff() {
    let state = MockState::new();
    state.set_register("plc", 1, 0, 7);
    state.push_failures("plc", MockFailure::Reset, 2);
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let start = Instant::now();
    let words = pool.execute(&key, read(0)).await.unwrap().into_words().unwrap();
    assert_eq!(words, vec![7]);

    // 1s + 2s of reconnect backoff
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4));
    assert_eq!(state.connect_count(), 3);

    let info = pool.status_of(&key).unwrap();
    assert!(info.connected);
    assert_eq!(info.reconnect_attempts, 0);
    assert_eq!(info.requests_served, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_respected() {
    let state = MockState::new();
    state.push_failures("plc", MockFailure::Reset, 10);
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let options = RequestOptions {
        timeout: Duration::from_secs(1),
        retries: 2,
    };
    let err = pool.execute_with(&key, read(0), options).await.unwrap_err();
    assert!(matches!(err, FieldError::ConnectionReset(_)));
    assert_eq!(state.calls_for(&key).len(), 3);
    assert_eq!(pool.status_of(&key).unwrap().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_cap_abandons_connection() {
    let state = MockState::new();
    state.set_offline("plc", true);
    let config = PoolConfig {
        max_reconnect_attempts: 2,
        reconnect: BackoffPolicy::from_millis(100, 1000),
        ..PoolConfig::default()
    };
    let pool = pool_with(&state, config);
    let key = ConnectionKey::new("plc", 502, 1);

    let options = RequestOptions {
        timeout: Duration::from_secs(1),
        retries: 10,
    };
    let err = pool.execute_with(&key, read(0), options).await.unwrap_err();
    assert!(err.is_connection_fault());
    assert_eq!(pool.status_of(&key).unwrap().reconnect_attempts, 2);

    // Next request connects again once the device is back
    state.set_offline("plc", false);
    assert!(pool.execute(&key, read(0)).await.is_ok());
    assert_eq!(pool.status_of(&key).unwrap().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn protocol_faults_are_not_retried() {
    let state = MockState::new();
    state.push_failure("plc", MockFailure::Exception(2));
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let err = pool.execute(&key, read(0)).await.unwrap_err();
    assert!(matches!(err, FieldError::ModbusException { code: 2, .. }));
    assert_eq!(state.calls_for(&key).len(), 1);

    // Session survives a protocol fault
    assert!(pool.execute(&key, read(0)).await.is_ok());
    assert_eq!(state.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn other_faults_retry_immediately() {
    let state = MockState::new();
    state.push_failure("plc", MockFailure::Io);
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let start = Instant::now();
    assert!(pool.execute(&key, read(0)).await.is_ok());
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(state.calls_for(&key).len(), 2);
    assert_eq!(state.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_fails_only_that_request() {
    let state = MockState::new();
    state.push_failure("plc", MockFailure::Hang);
    state.set_register("plc", 1, 5, 55);
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let no_retry = RequestOptions {
        timeout: Duration::from_millis(500),
        retries: 0,
    };
    let first = pool.execute_with(&key, read(0), no_retry);
    let second = pool.execute(&key, read(5));
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first.unwrap_err(), FieldError::Timeout(_)));
    assert_eq!(second.unwrap().into_words().unwrap(), vec![55]);
}

#[tokio::test(start_paused = true)]
async fn validation_happens_before_io() {
    let state = MockState::new();
    let pool = pool_with(&state, PoolConfig::default());

    let err = pool
        .execute(
            &ConnectionKey::new("plc", 502, 1),
            Request::ReadHoldingRegisters {
                address: 0,
                quantity: 126,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = pool
        .execute(&ConnectionKey::new("plc", 502, 0), read(0))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert!(state.calls().is_empty());
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_write_lands() {
    let state = MockState::new();
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("relay", 502, 1);

    pool.write_fire_and_forget(
        &key,
        Request::WriteSingleCoil {
            address: 3,
            value: true,
        },
    )
    .unwrap();
    assert!(pool.write_fire_and_forget(&key, read(0)).is_err());

    // A later acknowledged request is queued behind the write
    let bits = pool
        .execute(
            &key,
            Request::ReadCoils {
                address: 3,
                quantity: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(bits, Response::Bits(vec![true]));
    assert!(state.coil("relay", 1, 3));
}

#[tokio::test(start_paused = true)]
async fn full_pool_evicts_oldest_idle_connection() {
    let state = MockState::new();
    let config = PoolConfig {
        max_connections: 2,
        ..PoolConfig::default()
    };
    let pool = pool_with(&state, config);
    let a = ConnectionKey::new("a", 502, 1);
    let b = ConnectionKey::new("b", 502, 1);
    let c = ConnectionKey::new("c", 502, 1);

    pool.execute(&a, read(0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.execute(&b, read(0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.execute(&c, read(0)).await.unwrap();

    assert_eq!(pool.len(), 2);
    assert!(pool.status_of(&a).is_none());
    assert!(pool.status_of(&b).is_some());
    assert!(pool.status_of(&c).is_some());
}

#[tokio::test(start_paused = true)]
async fn full_pool_with_busy_connections_rejects() {
    let state = MockState::new();
    state.push_failure("a", MockFailure::Hang);
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = pool_with(&state, config);
    let a = ConnectionKey::new("a", 502, 1);

    let busy_pool = pool.clone();
    let busy_key = a.clone();
    let pending = tokio::spawn(async move {
        let options = RequestOptions {
            timeout: Duration::from_secs(5),
            retries: 0,
        };
        busy_pool.execute_with(&busy_key, read(0), options).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = pool
        .execute(&ConnectionKey::new("b", 502, 1), read(0))
        .await
        .unwrap_err();
    assert!(matches!(err, FieldError::ResourceBusy(_)));

    assert!(pending.await.unwrap().is_err());
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_swept() {
    let state = MockState::new();
    let config = PoolConfig {
        idle_timeout: Duration::from_secs(10),
        ..PoolConfig::default()
    };
    let pool = pool_with(&state, config);
    let key = ConnectionKey::new("plc", 502, 1);

    pool.execute(&key, read(0)).await.unwrap();
    assert_eq!(pool.sweep_idle().await, 0);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(pool.sweep_idle().await, 1);
    assert!(pool.is_empty());
    assert_eq!(state.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_queued_requests_and_closes_sessions() {
    let state = MockState::new();
    state.set_latency(Duration::from_millis(100));
    let pool = pool_with(&state, PoolConfig::default());
    let key = ConnectionKey::new("plc", 502, 1);

    let handles: Vec<_> = (0..3u16)
        .map(|addr| {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.execute(&key, read(addr)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.shutdown_all().await;

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(FieldError::Shutdown(_))))
            .count(),
        2
    );

    assert!(pool.is_empty());
    assert_eq!(state.close_count(), 1);
    assert!(matches!(
        pool.execute(&key, read(0)).await,
        Err(FieldError::Shutdown(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn list_connections_reports_each_key() {
    let state = MockState::new();
    let pool = pool_with(&state, PoolConfig::default());
    for host in ["b", "a"] {
        pool.execute(&ConnectionKey::new(host, 502, 1), read(0))
            .await
            .unwrap();
    }

    let list = pool.list_connections();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].key.host, "a");
    assert!(list.iter().all(|c| c.connected && !c.busy && c.queue_depth == 0));

    assert!(pool.disconnect(&ConnectionKey::new("a", 502, 1)).await);
    assert!(!pool.disconnect(&ConnectionKey::new("a", 502, 1)).await);
    assert_eq!(pool.len(), 1);
}
