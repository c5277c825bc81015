#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use compcontrol_domain::{Connection, Whitelist};
use compcontrol_protocol::DispatchOutcome;
use proptest::prelude::*;
use tokio::time::timeout;

use crate::server::dispatcher::{DispatchInput, DispatchMode, Dispatcher, DispatcherConfig};
use crate::server::fanout::fan_out;
use crate::server::gateway::PushError;
use crate::server::key_store::{InMemoryKeyStore, KeyStore};
use crate::server::pinger::Pinger;
use crate::server::registry::{ConnectionRegistry, InMemoryRegistry};
use crate::server::testing::{
	CountingRegistry, FailingKeyStore, FailingRegistry, RecordingGateway, conn, key,
};

const RESTART: &str = r#"{"type":"command","subtype":"restart"}"#;

struct Fixture {
	registry: Arc<CountingRegistry>,
	gateway: Arc<RecordingGateway>,
	dispatcher: Dispatcher,
}

async fn fixture(cfg: DispatcherConfig, gateway: RecordingGateway, connections: &[(&str, &str)]) -> Fixture {
	let keys = Arc::new(InMemoryKeyStore::with_keys([key("K1"), key("K2")]));
	let registry = Arc::new(CountingRegistry::default());
	for (i, (id, k)) in connections.iter().enumerate() {
		registry
			.upsert(Connection::new(conn(id), key(k), i as i64))
			.await
			.expect("seed");
	}
	let gateway = Arc::new(gateway);
	let dispatcher = Dispatcher::new(
		Whitelist::from_strs(["restart", "lock"]),
		keys,
		registry.clone(),
		gateway.clone(),
		cfg,
	);
	Fixture {
		registry,
		gateway,
		dispatcher,
	}
}

fn request<'a>(command: &'a str, presented: Option<&'a compcontrol_domain::AuthKey>) -> DispatchInput<'a> {
	DispatchInput::Request {
		command,
		presented_key: presented,
	}
}

#[tokio::test]
async fn targeted_dispatch_reaches_only_connections_of_the_key() {
	let f = fixture(
		DispatcherConfig::default(),
		RecordingGateway::new(),
		&[("c1", "K2"), ("c2", "K2"), ("c3", "K1")],
	)
	.await;

	let k2 = key("K2");
	let outcome = f.dispatcher.handle(request("restart", Some(&k2))).await;
	assert_eq!(outcome, DispatchOutcome::Success);
	assert_eq!(f.gateway.delivered_to(), vec![conn("c1"), conn("c2")]);
	assert!(f.gateway.attempts().iter().all(|(_, payload)| payload == RESTART));
}

#[tokio::test]
async fn rejected_command_touches_nothing() {
	let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[("c1", "K2")]).await;
	let before = f.registry.calls();

	let k2 = key("K2");
	for command in ["wipe", "RESTART", "restart ", ""] {
		let outcome = f.dispatcher.handle(request(command, Some(&k2))).await;
		assert_eq!(outcome, DispatchOutcome::CommandNotAllowed, "command {command:?}");
	}

	assert_eq!(f.registry.calls(), before);
	assert!(f.gateway.attempts().is_empty());
}

#[tokio::test]
async fn whitelist_is_checked_before_the_token() {
	let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[]).await;
	assert_eq!(f.dispatcher.handle(request("wipe", None)).await, DispatchOutcome::CommandNotAllowed);
}

#[tokio::test]
async fn missing_and_unknown_tokens_are_rejected() {
	let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[("c1", "K2")]).await;

	assert_eq!(f.dispatcher.handle(request("lock", None)).await, DispatchOutcome::MissingToken);

	let bogus = key("nope");
	assert_eq!(
		f.dispatcher.handle(request("lock", Some(&bogus))).await,
		DispatchOutcome::InvalidToken
	);
	assert!(f.gateway.attempts().is_empty());
}

#[tokio::test]
async fn valid_key_without_connections_is_not_found() {
	let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[("c1", "K2")]).await;
	let k1 = key("K1");
	let outcome = f.dispatcher.handle(request("lock", Some(&k1))).await;
	assert_eq!(outcome, DispatchOutcome::NoTargets);
	assert_eq!(outcome.status_code(), 404);
}

#[tokio::test]
async fn store_failures_map_to_store_unavailable() {
	let gateway = Arc::new(RecordingGateway::new());

	let keys_down = Dispatcher::new(
		Whitelist::from_strs(["lock"]),
		Arc::new(FailingKeyStore),
		Arc::new(InMemoryRegistry::new()),
		gateway.clone(),
		DispatcherConfig::default(),
	);
	let k1 = key("K1");
	assert_eq!(
		keys_down.handle(request("lock", Some(&k1))).await,
		DispatchOutcome::StoreUnavailable
	);

	let registry_down = Dispatcher::new(
		Whitelist::from_strs(["lock"]),
		Arc::new(InMemoryKeyStore::with_keys([key("K1")])),
		Arc::new(FailingRegistry),
		gateway.clone(),
		DispatcherConfig::default(),
	);
	assert_eq!(
		registry_down.handle(request("lock", Some(&k1))).await,
		DispatchOutcome::StoreUnavailable
	);
	assert!(gateway.attempts().is_empty());
}

#[tokio::test]
async fn partial_push_failure_still_succeeds() {
	let f = fixture(
		DispatcherConfig::default(),
		RecordingGateway::new().failing("c2", PushError::Gone),
		&[("c1", "K2"), ("c2", "K2"), ("c3", "K2")],
	)
	.await;

	let k2 = key("K2");
	assert_eq!(f.dispatcher.handle(request("restart", Some(&k2))).await, DispatchOutcome::Success);
	assert_eq!(f.gateway.attempts().len(), 3);
	assert_eq!(f.gateway.delivered_to(), vec![conn("c1"), conn("c3")]);
	// Eviction is off by default: the stale entry stays.
	assert_eq!(f.registry.count().await.expect("count"), 3);
}

#[tokio::test]
async fn gone_connections_are_evicted_when_enabled() {
	let cfg = DispatcherConfig {
		evict_gone_connections: true,
		..DispatcherConfig::default()
	};
	let f = fixture(
		cfg,
		RecordingGateway::new()
			.failing("c2", PushError::Gone)
			.failing("c3", PushError::QueueFull),
		&[("c1", "K2"), ("c2", "K2"), ("c3", "K2")],
	)
	.await;

	let k2 = key("K2");
	assert_eq!(f.dispatcher.handle(request("restart", Some(&k2))).await, DispatchOutcome::Success);
	assert_eq!(f.registry.by_key(&k2).await.expect("by_key"), vec![conn("c1"), conn("c3")]);
}

#[tokio::test]
async fn stalled_push_times_out_without_blocking_others() {
	let cfg = DispatcherConfig {
		push_timeout: Duration::from_millis(50),
		..DispatcherConfig::default()
	};
	let f = fixture(
		cfg,
		RecordingGateway::new().stalled("c1"),
		&[("c1", "K2"), ("c2", "K2")],
	)
	.await;

	let k2 = key("K2");
	let outcome = timeout(Duration::from_secs(2), f.dispatcher.handle(request("restart", Some(&k2))))
		.await
		.expect("dispatch must finish despite a stalled push");
	assert_eq!(outcome, DispatchOutcome::Success);
	assert_eq!(f.gateway.delivered_to(), vec![conn("c2")]);
}

#[tokio::test]
async fn broadcast_mode_targets_every_connection() {
	let cfg = DispatcherConfig {
		mode: DispatchMode::Broadcast,
		..DispatcherConfig::default()
	};
	let f = fixture(cfg, RecordingGateway::new(), &[("c1", "K1"), ("c2", "K2")]).await;
	assert_eq!(f.dispatcher.mode(), DispatchMode::Broadcast);

	assert_eq!(f.dispatcher.handle(request("lock", None)).await, DispatchOutcome::Success);
	assert_eq!(f.gateway.delivered_to(), vec![conn("c1"), conn("c2")]);

	// Still whitelist-gated.
	assert_eq!(f.dispatcher.handle(request("wipe", None)).await, DispatchOutcome::CommandNotAllowed);
}

#[tokio::test]
async fn broadcast_with_no_connections_succeeds() {
	let cfg = DispatcherConfig {
		mode: DispatchMode::Broadcast,
		..DispatcherConfig::default()
	};
	let f = fixture(cfg, RecordingGateway::new(), &[]).await;
	assert_eq!(f.dispatcher.handle(request("lock", None)).await, DispatchOutcome::Success);
	assert!(f.gateway.attempts().is_empty());
}

#[tokio::test]
async fn warmer_touches_nothing() {
	let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[("c1", "K1")]).await;
	let before = f.registry.calls();

	let outcome = f.dispatcher.handle(DispatchInput::Warmer).await;
	assert_eq!(outcome, DispatchOutcome::Warmed);
	assert_eq!(outcome.body().message, "OK (Warmer path)");
	assert_eq!(f.registry.calls(), before);
	assert!(f.gateway.attempts().is_empty());
}

#[test]
fn dispatch_mode_parses_aliases() {
	assert_eq!("targeted".parse::<DispatchMode>(), Ok(DispatchMode::Targeted));
	assert_eq!(" ALL ".parse::<DispatchMode>(), Ok(DispatchMode::Broadcast));
	assert!("sideways".parse::<DispatchMode>().is_err());
}

#[tokio::test]
async fn fan_out_reports_each_failure() {
	let gateway = RecordingGateway::new()
		.failing("b", PushError::Gone)
		.failing("c", PushError::QueueFull);
	let targets = [conn("a"), conn("b"), conn("c")];

	let report = fan_out(&gateway, &targets, "{}", Duration::from_millis(100)).await;
	assert_eq!(report.attempted, 3);
	assert_eq!(report.delivered(), 1);
	assert_eq!(report.gone().cloned().collect::<Vec<_>>(), vec![conn("b")]);
	assert!(report.failures.contains(&(conn("c"), PushError::QueueFull)));
}

#[tokio::test]
async fn pinger_tolerates_a_stale_connection() {
	let registry = Arc::new(InMemoryRegistry::new());
	for (id, k) in [("c1", "K1"), ("c2", "K1"), ("c3", "K2")] {
		registry
			.upsert(Connection::new(conn(id), key(k), 0))
			.await
			.expect("seed");
	}
	let gateway = Arc::new(RecordingGateway::new().failing("c2", PushError::Gone));
	let pinger = Pinger::new(registry.clone(), gateway.clone(), Duration::from_millis(100));

	let report = pinger.ping_all().await;
	assert_eq!(report.attempted, 3);
	assert_eq!(report.delivered(), 2);
	assert_eq!(gateway.delivered_to(), vec![conn("c1"), conn("c3")]);
	assert!(
		gateway
			.attempts()
			.iter()
			.all(|(_, payload)| payload == r#"{"type":"nop","subtype":"ping"}"#)
	);
	// Pinging never prunes.
	assert_eq!(registry.count().await.expect("count"), 3);
}

#[tokio::test]
async fn pinger_survives_registry_outage() {
	let gateway = Arc::new(RecordingGateway::new());
	let pinger = Pinger::new(Arc::new(FailingRegistry), gateway.clone(), Duration::from_millis(100));

	let report = pinger.ping_all().await;
	assert_eq!(report.attempted, 0);
	assert!(gateway.attempts().is_empty());
}

#[tokio::test]
async fn key_membership_is_read_not_written_by_dispatch() {
	let keys = Arc::new(InMemoryKeyStore::new());
	let dispatcher = Dispatcher::new(
		Whitelist::from_strs(["lock"]),
		keys.clone(),
		Arc::new(InMemoryRegistry::new()),
		Arc::new(RecordingGateway::new()),
		DispatcherConfig::default(),
	);
	let k = key("fresh");
	assert_eq!(dispatcher.handle(request("lock", Some(&k))).await, DispatchOutcome::InvalidToken);
	assert!(!keys.exists(&k).await.expect("exists"));
}

proptest! {
	#[test]
	fn unlisted_commands_never_reach_the_registry(command in "[a-zA-Z0-9_ -]{0,16}") {
		prop_assume!(command != "restart" && command != "lock");

		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.expect("runtime");
		let (outcome, calls, attempts) = rt.block_on(async {
			let f = fixture(DispatcherConfig::default(), RecordingGateway::new(), &[("c1", "K1")]).await;
			let before = f.registry.calls();
			let k1 = key("K1");
			let outcome = f.dispatcher.handle(request(&command, Some(&k1))).await;
			(outcome, f.registry.calls() - before, f.gateway.attempts().len())
		});

		prop_assert_eq!(outcome, DispatchOutcome::CommandNotAllowed);
		prop_assert_eq!(calls, 0);
		prop_assert_eq!(attempts, 0);
	}
}
