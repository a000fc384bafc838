//! Primary to replica propagation through the backlog.

use bytes::Bytes;
use viator_bloom::persistence::AofReader;
use viator_bloom::{BloomObject, Config, Engine, Frame, ObjectDigest};

fn argv(args: &[&str]) -> Vec<Bytes> {
    args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect()
}

fn digest(engine: &Engine, key: &str) -> Option<ObjectDigest> {
    engine
        .database()
        .with_bloom(key.as_bytes(), BloomObject::digest)
        .unwrap()
}

/// Apply everything the primary has forwarded since `offset`.
async fn sync(primary: &Engine, replica: &Engine, offset: i64) -> i64 {
    let chunks = primary
        .backlog()
        .get_from_offset(offset)
        .expect("offset still in backlog");
    let stream: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

    let mut reader = AofReader::from_bytes(stream);
    while let Some(command) = reader.next_command().unwrap() {
        replica.execute_replicated(command).await.unwrap();
    }
    primary.backlog().current_offset()
}

async fn exercise(primary: &Engine) {
    primary.call(argv(&["BF.ADD", "a", "x"])).await;
    primary.call(argv(&["BF.MADD", "a", "y", "z", "x"])).await;
    primary
        .call(argv(&["BF.RESERVE", "b", "0.001", "200", "EXPANSION", "4"]))
        .await;
    let items: Vec<String> = (0..1_000).map(|i| format!("item-{i}")).collect();
    let mut madd = vec!["BF.MADD", "b"];
    madd.extend(items.iter().map(String::as_str));
    primary.call(argv(&madd)).await;
    primary
        .call(argv(&["BF.INSERT", "c", "NONSCALING", "CAPACITY", "5", "ITEMS", "p", "q"]))
        .await;
    primary
        .call(argv(&["BF.INSERT", "d", "TIGHTENING", "0.25", "ERROR", "0.02"]))
        .await;
}

async fn assert_converges(random_seed: bool) {
    let primary = Engine::new(Config::new().bloom_use_random_seed(random_seed));
    let replica = Engine::new(Config::new().bloom_use_random_seed(!random_seed));

    exercise(&primary).await;
    sync(&primary, &replica, 0).await;

    for key in ["a", "b", "c", "d"] {
        let expected = digest(&primary, key);
        assert!(expected.is_some(), "{key}");
        assert_eq!(digest(&replica, key), expected, "{key}");
    }
    assert_eq!(
        replica.call(argv(&["BF.INFO", "d", "TIGHTENING"])).await,
        Frame::bulk("0.25")
    );
}

#[tokio::test]
async fn replica_matches_fixed_seed_primary() {
    assert_converges(false).await;
}

#[tokio::test]
async fn replica_matches_random_seed_primary() {
    assert_converges(true).await;
}

#[tokio::test]
async fn reads_and_noop_writes_are_not_forwarded() {
    let primary = Engine::new(Config::new().bloom_use_random_seed(false));
    primary.call(argv(&["BF.ADD", "k", "x"])).await;
    let offset = primary.backlog().current_offset();

    primary.call(argv(&["BF.ADD", "k", "x"])).await;
    primary.call(argv(&["BF.EXISTS", "k", "x"])).await;
    primary.call(argv(&["BF.INFO", "k"])).await;
    primary.call(argv(&["BF.RESERVE", "k", "0.01", "10"])).await;
    assert_eq!(primary.backlog().current_offset(), offset);
}

#[tokio::test]
async fn partial_batch_forwards_processed_prefix() {
    let primary = Engine::new(Config::new().bloom_use_random_seed(false));
    let replica = Engine::new(Config::new());
    primary
        .call(argv(&["BF.RESERVE", "k", "0.001", "10", "NONSCALING"]))
        .await;

    let items: Vec<String> = (0..40).map(|i| format!("item-{i}")).collect();
    let mut madd = vec!["BF.MADD", "k"];
    madd.extend(items.iter().map(String::as_str));
    let Frame::Array(replies) = primary.call(argv(&madd)).await else {
        panic!("MADD must reply with an array");
    };
    assert!(matches!(replies.last(), Some(Frame::Error(_))));
    assert!(replies.len() < items.len());

    sync(&primary, &replica, 0).await;
    assert_eq!(digest(&replica, "k"), digest(&primary, "k"));
    assert_eq!(
        replica.call(argv(&["BF.CARD", "k"])).await,
        Frame::Integer(10)
    );
}

#[tokio::test]
async fn replica_applies_objects_over_its_own_limit() {
    let primary = Engine::new(Config::new().bloom_use_random_seed(false));
    let replica = Engine::new(Config::new().bloom_memory_limit(1024));

    primary
        .call(argv(&["BF.RESERVE", "big", "0.0001", "50000"]))
        .await;
    sync(&primary, &replica, 0).await;

    assert_eq!(digest(&replica, "big"), digest(&primary, "big"));
    assert_eq!(
        replica.call(argv(&["BF.ADD", "other", "x"])).await,
        Frame::Integer(1)
    );
}

#[tokio::test]
async fn independent_random_objects_diverge() {
    let left = Engine::new(Config::new().bloom_use_random_seed(true));
    let right = Engine::new(Config::new().bloom_use_random_seed(true));
    for engine in [&left, &right] {
        engine.call(argv(&["BF.MADD", "k", "a", "b", "c"])).await;
    }
    assert_ne!(digest(&left, "k"), digest(&right, "k"));

    let fixed_left = Engine::new(Config::new().bloom_use_random_seed(false));
    let fixed_right = Engine::new(Config::new().bloom_use_random_seed(false));
    for engine in [&fixed_left, &fixed_right] {
        engine.call(argv(&["BF.MADD", "k", "a", "b", "c"])).await;
    }
    assert_eq!(digest(&fixed_left, "k"), digest(&fixed_right, "k"));
}
