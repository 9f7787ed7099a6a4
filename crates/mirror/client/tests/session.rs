//! End-to-end scenarios against a real server on a loopback socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use mirror_client::{ClientData, Limits, RpcError, Session, PROPERTY_CHANGED};
use mirror_server::{
	Descriptor, DtoCore, InvokeError, ParamKind, Server, ServerData, ServerDto,
};
use tokio::net::TcpListener;

/// The object graph the scenarios run against: a root lobby with an optional
/// annex room. The root references its annex weakly, so a test can observe
/// whether the server still holds the annex through its resolver.
struct Lobby {
	core: DtoCore,
	topic: Mutex<String>,
	annex: Mutex<Option<Weak<Lobby>>>,
}

impl Lobby {
	fn new(topic: &str) -> Arc<Self> {
		Arc::new(Self {
			core: DtoCore::new(),
			topic: Mutex::new(topic.to_owned()),
			annex: Mutex::new(None),
		})
	}

	fn set_topic(&self, topic: &str) {
		*self.topic.lock().unwrap() = topic.to_owned();
		self.core.property_changed("Topic");
	}

	fn ping(&self, count: i64) {
		self.core.raise("Ping", serde_json::json!({ "count": count }));
	}
}

fn lobby_descriptor() -> &'static Descriptor {
	static DESCRIPTOR: OnceLock<Descriptor> = OnceLock::new();
	DESCRIPTOR.get_or_init(|| {
		Descriptor::builder::<Lobby>("Lobby")
			.method("Echo", &[ParamKind::Text], |_, mut args| Ok(args.remove(0)))
			.method("Sum", &[ParamKind::Int, ParamKind::Int], |_, args| {
				let a = args[0].as_i64().unwrap();
				let b = args[1].as_i64().unwrap();
				Ok(ServerData::from(a + b))
			})
			.method("IsSame", &[ParamKind::Object], |lobby: &Lobby, args| {
				let same = args[0].as_object().is_some_and(|other| {
					other
						.as_any()
						.downcast_ref::<Lobby>()
						.is_some_and(|other| std::ptr::eq(other, lobby))
				});
				Ok(ServerData::from(same))
			})
			.method("Nap", &[ParamKind::Int], |_, args| {
				let millis = args[0].as_i64().unwrap().max(0) as u64;
				std::thread::sleep(Duration::from_millis(millis));
				Ok(ServerData::null())
			})
			.method("Fail", &[], |_, _| {
				Err(InvokeError::new("lobby failure").with_inner("the inner detail"))
			})
			.property_rw(
				"Topic",
				ParamKind::Text,
				|lobby: &Lobby| ServerData::from(lobby.topic.lock().unwrap().clone()),
				|lobby: &Lobby, value| {
					lobby.set_topic(value.as_str().expect("aligned"));
					Ok(())
				},
			)
			.property("Annex", |lobby: &Lobby| {
				match lobby.annex.lock().unwrap().as_ref().and_then(Weak::upgrade) {
					Some(annex) => ServerData::Object(annex),
					None => ServerData::null(),
				}
			})
			.event("Ping")
			.build()
	})
}

impl ServerDto for Lobby {
	fn core(&self) -> &DtoCore {
		&self.core
	}

	fn descriptor(&self) -> &Descriptor {
		lobby_descriptor()
	}

	fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
		self
	}
}

async fn serve(root: Arc<Lobby>) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(Server::new(root).serve(listener));
	addr
}

/// A root whose annex the server only reaches through its resolver: the
/// returned `Weak` observes whether any session still exposes the annex.
fn root_with_annex(topic: &str) -> (Arc<Lobby>, Arc<Lobby>, Weak<Lobby>) {
	let root = Lobby::new(topic);
	let annex = Lobby::new("annex topic");
	let watch = Arc::downgrade(&annex);
	*root.annex.lock().unwrap() = Some(Arc::downgrade(&annex));
	(root, annex, watch)
}

#[tokio::test]
async fn test_both_clients_see_the_same_root_identifier() {
	let root = Lobby::new("welcome");
	let addr = serve(root).await;

	let first = Session::connect(addr).await.unwrap();
	let second = Session::connect(addr).await.unwrap();

	let first_root = first.root().await.unwrap();
	let second_root = second.root().await.unwrap();
	assert_eq!(first_root.id(), second_root.id());
	assert_eq!(first_root.type_name(), "Lobby");
	assert!(first_root.is_populated());
	// The population snapshot carried the current property values.
	assert_eq!(
		first_root.cached("Topic").unwrap().as_str(),
		Some("welcome")
	);
}

#[tokio::test]
async fn test_method_calls_round_trip() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let echoed = root.invoke("Echo", vec!["hi".into()]).await.unwrap();
	assert_eq!(echoed.as_str(), Some("hi"));

	let sum = root
		.invoke("Sum", vec![2i64.into(), 40i64.into()])
		.await
		.unwrap();
	assert_eq!(sum.as_i64(), Some(42));
}

#[tokio::test]
async fn test_concurrent_requests_correlate_by_message_id() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let calls = (0..32).map(|i| {
		let root = root.clone();
		async move {
			let text = format!("payload-{i}");
			let reply = root.invoke("Echo", vec![text.clone().into()]).await.unwrap();
			assert_eq!(reply.as_str(), Some(text.as_str()));
		}
	});
	futures::future::join_all(calls).await;
}

#[tokio::test]
async fn test_get_after_set_observes_the_write() {
	let addr = serve(Lobby::new("before")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	assert_eq!(root.get("Topic").await.unwrap().as_str(), Some("before"));
	root.set("Topic", "after").await.unwrap();
	assert_eq!(root.get("Topic").await.unwrap().as_str(), Some("after"));
	assert_eq!(root.cached("Topic").unwrap().as_str(), Some("after"));
}

#[tokio::test]
async fn test_unknown_property_is_a_typed_exception() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let err = root.get("Nonexistent").await.unwrap_err();
	let RpcError::UnknownMember(message) = err else {
		panic!("expected UnknownMember, got {err:?}");
	};
	assert!(message.contains("unknown property"));
}

#[tokio::test]
async fn test_invocation_failure_carries_one_inner_level() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let err = root.invoke("Fail", vec![]).await.unwrap_err();
	let RpcError::Invocation { message, inner } = err else {
		panic!("expected Invocation, got {err:?}");
	};
	assert_eq!(message, "lobby failure");
	assert_eq!(inner.as_deref(), Some("the inner detail"));
}

#[tokio::test]
async fn test_arity_mismatch_names_the_method() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let err = root
		.invoke("Sum", vec![1i64.into(), 2i64.into(), 3i64.into()])
		.await
		.unwrap_err();
	let RpcError::ArityMismatch(message) = err else {
		panic!("expected ArityMismatch, got {err:?}");
	};
	assert!(message.contains("Sum"));
}

#[tokio::test]
async fn test_object_arguments_resolve_to_the_same_server_object() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let same = root
		.invoke("IsSame", vec![root.clone().into()])
		.await
		.unwrap();
	assert_eq!(same.as_bool(), Some(true));
}

#[tokio::test]
async fn test_successive_receipts_yield_the_same_proxy() {
	let (root, _annex, _watch) = root_with_annex("t");
	let addr = serve(root).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let first = root.get("Annex").await.unwrap().into_object().unwrap();
	let second = root.get("Annex").await.unwrap().into_object().unwrap();
	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(first.cached("Topic").unwrap().as_str(), Some("annex topic"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_property_change_notifies_exactly_once_until_removed() {
	let root = Lobby::new("old");
	let addr = serve(root.clone()).await;
	let session = Session::connect(addr).await.unwrap();
	let proxy = session.root().await.unwrap();

	let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
	proxy
		.on(PROPERTY_CHANGED, move |data| {
			let _ = events_tx.send(data);
		})
		.await
		.unwrap();

	root.set_topic("new");

	let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
		.await
		.expect("a notification should arrive")
		.unwrap();
	let ClientData::Map(change) = event else {
		panic!("expected a property-change map");
	};
	assert_eq!(change["name"].as_str(), Some("Topic"));
	assert_eq!(change["value"].as_str(), Some("new"));

	// The cached value was updated before the handler ran.
	assert_eq!(proxy.cached("Topic").unwrap().as_str(), Some("new"));

	// Exactly one delivery per mutation.
	assert!(
		tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
			.await
			.is_err()
	);

	proxy.off(PROPERTY_CHANGED).await.unwrap();
	root.set_topic("ignored");
	assert!(
		tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
			.await
			.is_err()
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_application_events_reach_subscribers() {
	let root = Lobby::new("t");
	let addr = serve(root.clone()).await;
	let session = Session::connect(addr).await.unwrap();
	let proxy = session.root().await.unwrap();

	let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
	proxy
		.on("Ping", move |data| {
			let _ = events_tx.send(data);
		})
		.await
		.unwrap();

	root.ping(7);

	let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
		.await
		.expect("a ping should arrive")
		.unwrap();
	let ClientData::Map(args) = event else {
		panic!("expected event args");
	};
	assert_eq!(args["count"].as_i64(), Some(7));
}

#[tokio::test]
async fn test_subscribing_to_an_undeclared_event_is_refused() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	let err = root.on("NoSuchEvent", |_| {}).await.unwrap_err();
	assert!(matches!(err, RpcError::UnknownMember(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finalization_releases_the_server_object() {
	let (root, annex, watch) = root_with_annex("t");
	let addr = serve(root).await;

	let limits = Limits {
		finalize_quiescence: Duration::from_millis(25),
		..Limits::default()
	};
	let session = Session::connect_with(addr, limits).await.unwrap();
	let proxy = session.root().await.unwrap();

	let annex_proxy = proxy.get("Annex").await.unwrap().into_object().unwrap();
	assert_eq!(annex_proxy.type_name(), "Lobby");

	// The session's resolver is what keeps the annex alive now.
	drop(annex);
	assert!(watch.upgrade().is_some());

	// Reclaim the proxy; after the quiescence window the pump releases the
	// identifier and the server lets go of the object.
	drop(annex_proxy);
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while watch.upgrade().is_some() {
		assert!(
			tokio::time::Instant::now() < deadline,
			"server never released the annex"
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	// The root itself is untouched and the session keeps working.
	assert_eq!(
		proxy.invoke("Echo", vec!["still up".into()]).await.unwrap().as_str(),
		Some("still up")
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resurrection_before_the_pump_keeps_the_identifier() {
	let (root, _annex, watch) = root_with_annex("t");
	let addr = serve(root).await;

	// A window long enough that the pump cannot fire mid-test.
	let limits = Limits {
		finalize_quiescence: Duration::from_secs(10),
		..Limits::default()
	};
	let session = Session::connect_with(addr, limits).await.unwrap();
	let proxy = session.root().await.unwrap();

	let first = proxy.get("Annex").await.unwrap().into_object().unwrap();
	let id = first.id();
	drop(first);

	// Re-receive the identifier before any release was sent: a live proxy
	// with the same identity, and the server still holds the object.
	let revived = proxy.get("Annex").await.unwrap().into_object().unwrap();
	assert_eq!(revived.id(), id);
	assert!(watch.upgrade().is_some());
	assert_eq!(
		revived.invoke("Echo", vec!["alive".into()]).await.unwrap().as_str(),
		Some("alive")
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_server_methods_time_out() {
	let addr = serve(Lobby::new("t")).await;
	let limits = Limits {
		request_timeout: Duration::from_millis(100),
		..Limits::default()
	};
	let session = Session::connect_with(addr, limits).await.unwrap();
	let root = session.root().await.unwrap();

	let err = root.invoke("Nap", vec![2_000i64.into()]).await.unwrap_err();
	assert_eq!(err, RpcError::Timeout);
}

#[tokio::test]
async fn test_closing_the_session_fails_callers() {
	let addr = serve(Lobby::new("t")).await;
	let session = Session::connect(addr).await.unwrap();
	let root = session.root().await.unwrap();

	session.close();
	let err = root.invoke("Echo", vec!["late".into()]).await.unwrap_err();
	assert_eq!(err, RpcError::SessionClosed);
}
