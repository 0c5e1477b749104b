//! Property and persistence tests for the prefix allocator

use std::collections::HashSet;
use std::net::IpAddr;

use meshtower_ipam::{AllocationError, Ipam, PersistenceError};
use proptest::prelude::*;

const ROOT: &str = "10.20.0.0/26";

#[derive(Debug, Clone)]
enum Op {
    Acquire(u8),
    Release(u8),
    Specific(u8, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8).prop_map(Op::Acquire),
        (0u8..64).prop_map(Op::Release),
        (0u8..64, 0u8..8).prop_map(|(host, owner)| Op::Specific(host, owner)),
    ]
}

fn host(n: u8) -> IpAddr {
    format!("10.20.0.{}", n).parse().unwrap()
}

proptest! {
    #[test]
    fn acquired_addresses_are_never_shared(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut ipam = Ipam::with_root(ROOT).unwrap();
        // address -> owner, maintained independently of the allocator
        let mut held: std::collections::HashMap<IpAddr, String> = Default::default();

        for op in ops {
            match op {
                Op::Acquire(owner) => {
                    let owner = format!("owner-{}", owner);
                    match ipam.acquire_ip(ROOT, &owner) {
                        Ok(ip) => {
                            prop_assert!(!held.contains_key(&ip), "{} handed out twice", ip);
                            held.insert(ip, owner);
                        }
                        Err(AllocationError::Exhausted(_)) => prop_assert_eq!(held.len(), 62),
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::Release(n) => {
                    let ip = host(n);
                    prop_assert_eq!(ipam.release_ip(ROOT, ip), held.remove(&ip).is_some());
                }
                Op::Specific(n, owner) => {
                    let ip = host(n);
                    let owner = format!("owner-{}", owner);
                    let result = ipam.acquire_specific_ip(ROOT, ip, &owner);
                    if n == 0 || n == 63 {
                        let is_out_of_range = matches!(result, Err(AllocationError::OutOfRange { .. }));
                        prop_assert!(is_out_of_range);
                        continue;
                    }
                    match held.get(&ip) {
                        Some(holder) if *holder != owner => {
                            let is_conflict = matches!(result, Err(AllocationError::Conflict { .. }));
                            prop_assert!(is_conflict);
                        }
                        _ => {
                            prop_assert_eq!(result.unwrap(), ip);
                            held.insert(ip, owner);
                        }
                    }
                }
            }
        }

        let prefix = ipam.prefix(ROOT).unwrap();
        let in_allocator: HashSet<IpAddr> = prefix.allocations().map(|(ip, _)| ip).collect();
        let in_model: HashSet<IpAddr> = held.keys().copied().collect();
        prop_assert_eq!(in_allocator, in_model);
    }
}

#[test]
fn test_specific_release_specific_returns_same_address() {
    let mut ipam = Ipam::with_root("10.30.0.0/24").unwrap();
    let x: IpAddr = "10.30.0.42".parse().unwrap();

    assert_eq!(ipam.acquire_specific_ip("10.30.0.0/24", x, "a").unwrap(), x);
    assert!(ipam.release_ip("10.30.0.0/24", x));
    assert_eq!(ipam.acquire_specific_ip("10.30.0.0/24", x, "a").unwrap(), x);
}

#[tokio::test]
async fn test_persistence_roundtrip_preserves_holdings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zone-ipam.json");

    let mut ipam = Ipam::with_root("10.40.0.0/28").unwrap();
    let held_a = ipam.acquire_ip("10.40.0.0/28", "a").unwrap();
    let held_b = ipam.acquire_ip("10.40.0.0/28", "b").unwrap();
    ipam.save(&path).await.unwrap();

    let mut restored = Ipam::restore(&path).await.unwrap();

    for held in [held_a, held_b] {
        assert!(matches!(
            restored.acquire_specific_ip("10.40.0.0/28", held, "intruder"),
            Err(AllocationError::Conflict { .. })
        ));
    }
    let free: IpAddr = "10.40.0.9".parse().unwrap();
    assert_eq!(
        restored
            .acquire_specific_ip("10.40.0.0/28", free, "intruder")
            .unwrap(),
        free
    );
    // the original holder still gets idempotent reuse after a restart
    assert_eq!(
        restored.acquire_specific_ip("10.40.0.0/28", held_a, "a").unwrap(),
        held_a
    );
}

#[tokio::test]
async fn test_restore_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let ipam = Ipam::restore(&dir.path().join("absent.json")).await.unwrap();
    assert!(ipam.is_empty());
}

#[tokio::test]
async fn test_restore_corrupt_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    tokio::fs::write(&path, "{ this is not json").await.unwrap();

    assert!(matches!(
        Ipam::restore(&path).await,
        Err(PersistenceError::CorruptState(_))
    ));
}

#[tokio::test]
async fn test_save_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state").join("ipam.json");

    Ipam::with_root("10.50.0.0/24")
        .unwrap()
        .save(&path)
        .await
        .unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());
}
