// Copyright 2020 Joyent, Inc.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use grid_rpc::config::{ClientConfig, ServerConfig};
use grid_rpc::registry::PlainProtocol;
use grid_rpc::{
    ArgType, Dispatcher, Endpoint, HandlerError, MethodRegistration,
    ProtocolRegistry, RpcError, Value,
};

use common::{
    client, closed_port, echo, no_kwargs, server_config, start_server, whoami,
    Pki,
};

const ECHO: &str = "Framework/Echo";

fn echo_service() -> Dispatcher {
    Dispatcher::builder(ECHO)
        .register(echo())
        .register(whoami())
        .build()
        .unwrap()
}

#[tokio::test]
async fn secure_echo() {
    let pki = Pki::new("echo");
    let server = start_server(
        Arc::new(pki.secure(pki.host("echo.example.org"))),
        echo_service(),
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dips", ECHO);

    let user = pki.user("alice", "user", &["NormalUser"]);
    let client = client(
        pki.registry(user),
        vec![(ECHO, vec![endpoint.clone()])],
        ClientConfig::default(),
    );

    let value = client
        .call(ECHO, "echo", vec![Value::from("ping")], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(value, Value::from("ping"));

    let id = client
        .call(ECHO, "whoami", vec![], no_kwargs(), None)
        .await
        .unwrap();
    let id = id.as_map().unwrap();
    assert_eq!(id["dn"], Value::from("/O=Grid/OU=Users/CN=alice"));
    assert_eq!(id["group"], Value::from("user"));
    assert_eq!(id["proxy"], Value::Bool(false));

    // Both calls went over one pooled connection.
    assert_eq!(client.pooled_connections(&endpoint), 1);
}

#[tokio::test]
async fn plain_transport_is_anonymous() {
    let server = start_server(
        Arc::new(PlainProtocol::default()),
        echo_service(),
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dip", ECHO);
    let client = client(
        ProtocolRegistry::standard(None),
        vec![(ECHO, vec![endpoint])],
        ClientConfig::default(),
    );

    let mut kwargs = BTreeMap::new();
    kwargs.insert(String::from("ignored"), Value::Int(1));
    let value = client
        .call(ECHO, "echo", vec![Value::bytes(vec![0u8, 1, 2])], kwargs, None)
        .await
        .unwrap();
    assert_eq!(value, Value::bytes(vec![0u8, 1, 2]));

    let err = client
        .call(ECHO, "whoami", vec![], no_kwargs(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Unauthorized(_)), "{:?}", err);
}

#[tokio::test]
async fn unauthorized_caller_never_reaches_handler() {
    let pki = Pki::new("admin");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let dispatcher = Dispatcher::builder("Framework/Admin")
        .register(
            MethodRegistration::new("restricted", move |_a, _k, _c| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, HandlerError>(Value::Null) }
            })
            .access(vec!["admin"]),
        )
        .build()
        .unwrap();
    let server = start_server(
        Arc::new(pki.secure(pki.host("admin.example.org"))),
        dispatcher,
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dips", "Framework/Admin");

    let user = client(
        pki.registry(pki.user("bob", "user", &["NormalUser"])),
        vec![("Framework/Admin", vec![endpoint.clone()])],
        ClientConfig::default(),
    );
    let err = user
        .call("Framework/Admin", "restricted", vec![], no_kwargs(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Unauthorized(_)), "{:?}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // A refused call is an answer, not a broken connection.
    assert_eq!(user.pooled_connections(&endpoint), 1);

    let admin = client(
        pki.registry(pki.user("carol", "admin", &[])),
        vec![("Framework/Admin", vec![endpoint])],
        ClientConfig::default(),
    );
    admin
        .call("Framework/Admin", "restricted", vec![], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failover_past_unreachable_endpoints() {
    let pki = Pki::new("failover");
    let server = start_server(
        Arc::new(pki.secure(pki.host("echo.example.org"))),
        echo_service(),
        server_config(),
    )
    .await;
    let good = server.endpoint("dips", ECHO);
    let dead1 = Endpoint::new("dips", "127.0.0.1", closed_port().await, ECHO);
    let dead2 = Endpoint::new("dips", "127.0.0.1", closed_port().await, ECHO);

    let client = client(
        pki.registry(pki.user("alice", "user", &[])),
        vec![(ECHO, vec![dead1.clone(), dead2.clone(), good.clone()])],
        ClientConfig::default(),
    );
    let report = client
        .call_detailed(ECHO, "echo", vec![Value::Int(7)], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(report.value, Value::Int(7));
    assert_eq!(report.endpoint, good);
    assert_eq!(report.suppressed.len(), 2);
    assert_eq!(report.suppressed[0].endpoint, dead1.to_string());
    assert_eq!(report.suppressed[1].endpoint, dead2.to_string());
    assert!(matches!(
        report.suppressed[0].error,
        RpcError::Connection(_)
    ));
}

#[tokio::test]
async fn all_endpoints_unreachable_and_no_endpoints() {
    let dead1 = Endpoint::new("dip", "127.0.0.1", closed_port().await, ECHO);
    let dead2 = Endpoint::new("dip", "127.0.0.1", closed_port().await, ECHO);
    let client = client(
        ProtocolRegistry::standard(None),
        vec![(ECHO, vec![dead1, dead2]), ("Framework/Nobody", vec![])],
        ClientConfig::default(),
    );

    match client.call(ECHO, "echo", vec![], no_kwargs(), None).await {
        Err(RpcError::AllEndpointsUnreachable(failures)) => {
            assert_eq!(failures.len(), 2)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        client
            .call("Framework/Nobody", "echo", vec![], no_kwargs(), None)
            .await,
        Err(RpcError::NoEndpoints(_))
    ));
}

#[tokio::test]
async fn untrusted_client_is_turned_away() {
    let pki = Pki::new("site");
    let rogue = Pki::new("rogue");
    let server = start_server(
        Arc::new(pki.secure(pki.host("echo.example.org"))),
        echo_service(),
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dips", ECHO);

    // Trusts the server's authority but holds a credential from another.
    let intruder = client(
        ProtocolRegistry::standard(Some(
            pki.secure(rogue.user("mallory", "user", &[])),
        )),
        vec![(ECHO, vec![endpoint.clone()])],
        ClientConfig::default(),
    );
    match intruder.call(ECHO, "echo", vec![], no_kwargs(), None).await {
        Err(RpcError::AllEndpointsUnreachable(failures)) => {
            assert_eq!(failures.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    // The server keeps serving everybody else.
    let alice = client(
        pki.registry(pki.user("alice", "user", &[])),
        vec![(ECHO, vec![endpoint])],
        ClientConfig::default(),
    );
    alice
        .call(ECHO, "echo", vec![Value::Null], no_kwargs(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn handler_faults_keep_the_connection() {
    let pki = Pki::new("faults");
    let dispatcher = Dispatcher::builder("WorkloadManagement/JobManager")
        .register(echo())
        .register(
            MethodRegistration::new(
                "getJob",
                |args: Vec<Value>, _k, _c| async move {
                    let id = args.get(0).and_then(Value::as_i64);
                    Err::<Value, _>(HandlerError::with_class(
                        format!("no such job {}", id.unwrap_or_default()),
                        "KeyError",
                    ))
                },
            )
            .access(vec!["all"])
            .signature(vec![ArgType::Int]),
        )
        .build()
        .unwrap();
    let server = start_server(
        Arc::new(pki.secure(pki.host("wms.example.org"))),
        dispatcher,
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dips", "WorkloadManagement/JobManager");
    let client = client(
        pki.registry(pki.user("alice", "user", &[])),
        vec![("WorkloadManagement/JobManager", vec![endpoint.clone()])],
        ClientConfig::default(),
    );
    let service = "WorkloadManagement/JobManager";

    match client
        .call(service, "getJob", vec![Value::Int(42)], no_kwargs(), None)
        .await
    {
        Err(RpcError::HandlerFailed { message, extra }) => {
            assert_eq!(message, "no such job 42");
            let extra = extra.unwrap();
            let class = &extra.as_map().unwrap()["exception"];
            assert_eq!(class, &Value::from("KeyError"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = client
        .call(service, "getJob", vec![Value::from("42")], no_kwargs(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::BadArguments(_)), "{:?}", err);

    let err = client
        .call(service, "deleteEverything", vec![], no_kwargs(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::MethodNotFound(_)), "{:?}", err);

    let args = vec![Value::from("still here")];
    let value = client
        .call(service, "echo", args, no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(value, Value::from("still here"));
    assert_eq!(client.pooled_connections(&endpoint), 1);
}

#[tokio::test]
async fn panicking_handler_leaves_connection_usable() {
    let server = start_server(
        Arc::new(PlainProtocol::default()),
        Dispatcher::builder(ECHO)
            .register(echo())
            .register(
                MethodRegistration::new(
                    "first",
                    |args: Vec<Value>, _k, _c| {
                        let first = args[0].clone();
                        async move { Ok::<_, HandlerError>(first) }
                    },
                )
                .access(vec!["anyone"]),
            )
            .build()
            .unwrap(),
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dip", ECHO);
    let client = client(
        ProtocolRegistry::standard(None),
        vec![(ECHO, vec![endpoint.clone()])],
        ClientConfig::default(),
    );

    let err = client
        .call(ECHO, "first", vec![], no_kwargs(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::HandlerFailed { .. }), "{:?}", err);
    assert_eq!(client.pooled_connections(&endpoint), 1);

    let value = client
        .call(ECHO, "echo", vec![Value::from("after")], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(value, Value::from("after"));
    assert_eq!(client.pooled_connections(&endpoint), 1);
}

#[tokio::test]
async fn timeout_discards_the_connection() {
    let pki = Pki::new("slow");
    let dispatcher = Dispatcher::builder("Framework/Slow")
        .register(echo())
        .register(
            MethodRegistration::new("sleep", |_a, _k, _c| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(Value::Null)
            })
            .access(vec!["all"]),
        )
        .build()
        .unwrap();
    let server = start_server(
        Arc::new(pki.secure(pki.host("slow.example.org"))),
        dispatcher,
        server_config(),
    )
    .await;
    let endpoint = server.endpoint("dips", "Framework/Slow");
    let client = client(
        pki.registry(pki.user("alice", "user", &[])),
        vec![("Framework/Slow", vec![endpoint.clone()])],
        ClientConfig::default(),
    );

    let limit = Duration::from_millis(200);
    let started = Instant::now();
    let err = client
        .call("Framework/Slow", "sleep", vec![], no_kwargs(), Some(limit))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout(limit));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.pooled_connections(&endpoint), 0);

    // The next call builds a fresh connection.
    client
        .call("Framework/Slow", "echo", vec![Value::Int(1)], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(client.pooled_connections(&endpoint), 1);
}

#[tokio::test]
async fn connection_limit_queues_clients() {
    let config = ServerConfig {
        max_connections: 1,
        idle_timeout_secs: 1,
        ..server_config()
    };
    let server =
        start_server(Arc::new(PlainProtocol::default()), echo_service(), config)
            .await;
    let endpoint = server.endpoint("dip", ECHO);

    let first = client(
        ProtocolRegistry::standard(None),
        vec![(ECHO, vec![endpoint.clone()])],
        ClientConfig::default(),
    );
    first
        .call(ECHO, "echo", vec![Value::Int(1)], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(first.pooled_connections(&endpoint), 1);

    // Waits until the first connection is closed for idleness, then gets
    // served rather than refused.
    let second = client(
        ProtocolRegistry::standard(None),
        vec![(ECHO, vec![endpoint])],
        ClientConfig::default(),
    );
    let value = second
        .call(ECHO, "echo", vec![Value::Int(2)], no_kwargs(), None)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(2));
}
