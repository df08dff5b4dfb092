mod common;

use std::{thread, time::Duration};

use common::{Member, MockServer, Op, Response, closed_port, hash_of};
use docwire::{
    ConnectionManager, Cursor, ReadMode, ReadPreference,
    connection::{MemberState, read_preference::parse_tagset},
    doc,
    error::{ConnectionError, Error},
    protocol::flags,
};

struct Cluster {
    a: MockServer,
    b: MockServer,
    c: MockServer,
}

/// `a` is primary; `b` and `c` are secondaries. `a` and `b` are tagged `dc:ny`, `c` is `dc:sf`.
fn cluster() -> Cluster {
    let listeners = [MockServer::bind(), MockServer::bind(), MockServer::bind()];
    let hosts: Vec<String> = listeners.iter().map(hash_of).collect();
    let members = vec![
        (hosts[0].clone(), "PRIMARY".to_string(), doc! { "dc" => "ny" }),
        (hosts[1].clone(), "SECONDARY".to_string(), doc! { "dc" => "ny" }),
        (hosts[2].clone(), "SECONDARY".to_string(), doc! { "dc" => "sf" }),
    ];

    let mut servers = listeners.into_iter().zip(hosts.iter()).map(|(listener, me)| {
        let member = Member {
            set: "rs0".to_string(),
            me: me.clone(),
            primary: hosts[0].clone(),
            hosts: hosts.clone(),
            members: members.clone(),
        };
        MockServer::serve(listener, move |op| {
            member.answer(op).or_else(|| match op {
                Op::Query { namespace, .. } if namespace == "app.things" => Some(
                    Response::document(doc! { "served_by" => member.me.as_str() }),
                ),
                _ => None,
            })
        })
    });

    let a = servers.next().unwrap();
    let b = servers.next().unwrap();
    let c = servers.next().unwrap();
    Cluster { a, b, c }
}

fn manager(uri: &str) -> ConnectionManager {
    let mut manager = ConnectionManager::new(uri).unwrap();
    manager.seed_rng(42);
    manager
}

fn secondary(tags: &[&str]) -> ReadPreference {
    preference(ReadMode::Secondary, tags)
}

fn preference(mode: ReadMode, tags: &[&str]) -> ReadPreference {
    let tagsets = tags.iter().map(|t| parse_tagset(t).unwrap()).collect();
    ReadPreference::new(mode, tagsets).unwrap()
}

#[test]
fn discovers_members_from_a_secondary_seed() {
    let cluster = cluster();
    let manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.b.hash()));

    assert_eq!(manager.primary_hash(), Some(cluster.a.hash().as_str()));
    assert_eq!(manager.hosts().count(), 3);
    assert_eq!(
        manager.host(&cluster.a.hash()).unwrap().state,
        MemberState::Primary
    );
    assert_eq!(
        manager.host(&cluster.c.hash()).unwrap().state,
        MemberState::Secondary
    );

    let view = manager.replica_set_view().unwrap();
    assert_eq!(view.len(), 3);
    assert_eq!(
        view.member(&cluster.c.hash())
            .unwrap()
            .tags
            .get("dc")
            .map(String::as_str),
        Some("sf")
    );

    assert!(cluster.b.ops().iter().any(|op| op.command() == Some("isMaster")));
    assert!(
        cluster
            .a
            .ops()
            .iter()
            .any(|op| op.command() == Some("replSetGetStatus"))
    );
}

#[test]
fn mismatched_set_name_is_fatal() {
    let cluster = cluster();
    let err = ConnectionManager::new(&format!(
        "mongodb://{},{}/?replicaSet=other",
        cluster.a.hash(),
        cluster.b.hash()
    ))
    .err()
    .unwrap();

    match err {
        Error::Connection(ConnectionError::ReplicaSetMismatch { expected, found }) => {
            assert_eq!(expected, "other");
            assert_eq!(found, "rs0");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(cluster.b.ops().is_empty());
}

#[test]
fn unreachable_seed_falls_through_to_the_next() {
    let cluster = cluster();
    let manager = manager(&format!(
        "mongodb://127.0.0.1:{},{}/?replicaSet=rs0&connectTimeoutMS=500",
        closed_port(),
        cluster.c.hash()
    ));
    assert_eq!(manager.primary_hash(), Some(cluster.a.hash().as_str()));
}

#[test]
fn exhausted_seeds_surface_the_last_failure() {
    let first = closed_port();
    let last = closed_port();
    let err = ConnectionManager::new(&format!(
        "mongodb://127.0.0.1:{first},127.0.0.1:{last}/?replicaSet=rs0&connectTimeoutMS=500"
    ))
    .err()
    .unwrap();

    match err {
        Error::Connection(ConnectionError::SeedsExhausted { last: message }) => {
            assert!(message.contains(&format!("127.0.0.1:{last}")), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn reads_route_by_preference() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.a.hash()));

    assert_eq!(
        manager.read_target(&ReadPreference::primary()).unwrap(),
        cluster.a.hash()
    );
    assert_eq!(
        manager.read_target(&secondary(&["dc:sf"])).unwrap(),
        cluster.c.hash()
    );

    let chosen = manager.read_target(&secondary(&[])).unwrap();
    assert!(chosen == cluster.b.hash() || chosen == cluster.c.hash());

    let nearest = manager
        .read_target(&preference(ReadMode::Nearest, &["dc:ny"]))
        .unwrap();
    assert!(nearest == cluster.a.hash() || nearest == cluster.b.hash());
}

#[test]
fn first_matching_tagset_wins() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.a.hash()));

    let chosen = manager
        .read_target(&secondary(&["dc:tokyo", "dc:ny", "dc:sf"]))
        .unwrap();
    assert_eq!(chosen, cluster.b.hash());
}

// Memoization is per manager and per serialized preference: a simplified affinity, not a
// session.
#[test]
fn resolution_sticks_to_the_first_choice() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.a.hash()));

    let first = manager.read_target(&secondary(&[])).unwrap();
    for _ in 0..20 {
        assert_eq!(manager.read_target(&secondary(&[])).unwrap(), first);
    }

    manager.discard(&first);
    let again = manager.read_target(&secondary(&[])).unwrap();
    assert!(again == cluster.b.hash() || again == cluster.c.hash());
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.b.hash()));

    let err = manager.read_target(&secondary(&["dc:tokyo"])).unwrap_err();
    assert!(err.to_string().contains("[{dc:tokyo}]"), "{err}");

    let chosen = manager
        .read_target(&preference(ReadMode::SecondaryPreferred, &["dc:tokyo"]))
        .unwrap();
    assert_eq!(chosen, cluster.a.hash());
}

#[test]
fn secondary_cursor_sets_slave_ok() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.a.hash()));

    let documents = Cursor::new(&mut manager, "app.things", doc! {})
        .read_preference(secondary(&["dc:sf"]))
        .collect::<docwire::Result<Vec<_>>>()
        .unwrap();

    assert_eq!(documents.len(), 1);
    assert_eq!(
        documents[0].get_str("served_by"),
        Some(cluster.c.hash().as_str())
    );
    let slave_ok = cluster.c.ops().iter().any(|op| {
        matches!(op, Op::Query { namespace, flags: f, .. }
            if namespace == "app.things" && f & flags::QUERY_SLAVE_OK != 0)
    });
    assert!(slave_ok);
}

#[test]
fn writes_go_to_the_primary_and_are_acknowledged() {
    let cluster = cluster();
    let mut manager = manager(&format!("mongodb://{}/?replicaSet=rs0", cluster.c.hash()));

    let ack = manager
        .write_protocol()
        .unwrap()
        .insert("app.things", &[doc! { "x" => 1 }], 0, None)
        .unwrap()
        .unwrap();
    assert_eq!(ack.get_f64("ok"), Some(1.0));

    let ops = cluster.a.ops();
    let insert = ops
        .iter()
        .position(|op| matches!(op, Op::Insert { namespace, .. } if namespace == "app.things"))
        .unwrap();
    assert!(matches!(
        &ops[insert + 1],
        Op::Query { namespace, query, .. }
            if namespace == "app.$cmd" && query.get_i32("getlasterror") == Some(1)
    ));
}

#[test]
fn unacknowledged_writes_skip_the_round_trip() {
    let cluster = cluster();
    let mut manager = manager(&format!(
        "mongodb://{}/?replicaSet=rs0&w=0",
        cluster.a.hash()
    ));

    let ack = manager
        .write_protocol()
        .unwrap()
        .insert("app.things", &[doc! { "x" => 1 }], 0, None)
        .unwrap();
    assert!(ack.is_none());

    assert!(cluster.a.wait_for(|op| matches!(op, Op::Insert { .. })));
    thread::sleep(Duration::from_millis(50));
    assert!(
        !cluster
            .a
            .ops()
            .iter()
            .any(|op| op.command() == Some("getlasterror"))
    );
}

#[test]
fn primary_preferred_reads_fail_over_to_a_secondary() {
    let listeners = [MockServer::bind(), MockServer::bind()];
    let hosts: Vec<String> = listeners.iter().map(hash_of).collect();
    let members = vec![
        (hosts[0].clone(), "PRIMARY".to_string(), doc! {}),
        (hosts[1].clone(), "SECONDARY".to_string(), doc! {}),
    ];
    let mut servers = listeners.into_iter().zip(hosts.iter()).map(|(listener, me)| {
        let member = Member {
            set: "rs0".to_string(),
            me: me.clone(),
            primary: hosts[0].clone(),
            hosts: hosts.clone(),
            members: members.clone(),
        };
        MockServer::serve(listener, move |op| member.answer(op))
    });
    let mut a = servers.next().unwrap();
    let b = servers.next().unwrap();

    let mut manager = manager(&format!(
        "mongodb://{}/?replicaSet=rs0&connectTimeoutMS=500",
        a.hash()
    ));
    let preferred = ReadPreference::with_mode(ReadMode::PrimaryPreferred);
    assert_eq!(manager.read_target(&preferred).unwrap(), a.hash());

    a.stop();
    manager.discard(&a.hash());

    assert_eq!(manager.read_target(&preferred).unwrap(), b.hash());
    assert_eq!(
        manager.host(&b.hash()).unwrap().state,
        MemberState::Secondary
    );
    // Only `a` was seeded; rediscovery reached `b` through the member list `a` reported.
    assert!(b.ops().iter().any(|op| op.command() == Some("isMaster")));
}
