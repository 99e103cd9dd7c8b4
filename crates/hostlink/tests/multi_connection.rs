//! Aggregate behaviour against the in-memory transport

mod common;

use anyhow::Result;
use bytes::Bytes;
use common::mock_factory;
use futures::TryStreamExt;
use hostlink::ssh::MockTransport;
use hostlink::{HostlinkError, MultiConnection, RemoteOps};
use std::collections::BTreeMap;
use std::path::Path;

#[test]
fn test_rotation_then_pop_scenario() -> Result<()> {
    let transport = MockTransport::new();
    let multi = MultiConnection::open(["h1", "h1", "h2"], mock_factory(&transport, 3))?;

    let pool = multi.get_all("h1")?;
    assert_eq!(pool.len(), 2);
    let (s1, s2) = (pool[0].clone(), pool[1].clone());

    assert_eq!(multi.get("h1")?, s1);
    assert_eq!(multi.get("h1")?, s2);
    assert_eq!(multi.get("h1")?, s1);

    let popped = multi.pop("h1")?;
    assert_eq!(popped, s1);
    assert!(multi.contains_key("h1"));
    assert_eq!(multi.get_all("h1")?, vec![s2.clone()]);

    assert_eq!(multi.pop("h1")?, s2);
    assert!(!multi.contains_key("h1"));
    assert_eq!(multi.keys(), vec!["h2"]);
    assert!(matches!(multi.pop("h1"), Err(HostlinkError::KeyNotFound { .. })));
    Ok(())
}

#[test]
fn test_merge_sums_pool_sizes() -> Result<()> {
    let transport = MockTransport::new();
    let factory = mock_factory(&transport, 3);
    let left = MultiConnection::open(["h1"], factory.clone())?;
    let right = MultiConnection::open(["h1", "h2"], factory)?;

    let merged = left.merge(right);
    let sizes = merged.to_descriptor().pool_sizes();
    let expected: BTreeMap<String, usize> = [("h1".to_string(), 2), ("h2".to_string(), 1)].into();
    assert_eq!(sizes, expected);
    assert_eq!(merged.len_all(), merged.items_all().len());
    Ok(())
}

#[tokio::test]
async fn test_string_roundtrip_reopens_disconnected() -> Result<()> {
    let transport = MockTransport::new();
    let factory = mock_factory(&transport, 3);
    let multi = MultiConnection::open(["h1", "h1", "h2"], factory.clone())?;
    multi.connect_all().await?;
    assert_eq!(transport.connect_count(), 3);

    let restored = MultiConnection::from_json_str(&multi.to_string(), factory)?;
    assert_eq!(restored.keys(), multi.keys());
    assert_eq!(restored.get_all("h1")?.len(), 2);
    assert_eq!(restored.get_all("h2")?.len(), 1);
    assert!(restored.values_all().iter().all(|s| !s.is_connected()));

    let h2 = restored.get("h2")?;
    assert_eq!(h2.credentials().port, 2222);
    assert!(h2.credentials().identity_file.is_some());
    Ok(())
}

#[tokio::test]
async fn test_fan_out_reaches_every_key() -> Result<()> {
    let transport = MockTransport::new();
    transport.insert_dir("/tmp");
    let multi = MultiConnection::open(["h1", "h2"], mock_factory(&transport, 3))?;

    multi
        .write("/tmp/marker", Bytes::from("ready"))
        .try_collect::<Vec<_>>()
        .await?;

    let contents: Vec<(String, String)> = multi.read_to_string("/tmp/marker").try_collect().await?;
    assert_eq!(
        contents,
        vec![
            ("h1".to_string(), "ready".to_string()),
            ("h2".to_string(), "ready".to_string()),
        ]
    );

    let outputs: Vec<_> = multi.run(vec!["uptime".to_string()]).buffered(2).try_collect().await?;
    assert!(outputs.iter().all(|(_, output)| output.success()));
    Ok(())
}

#[tokio::test]
async fn test_fan_out_fails_fast() -> Result<()> {
    let transport = MockTransport::new();
    let multi = MultiConnection::open(["h1", "h2"], mock_factory(&transport, 3))?;

    let result: hostlink::Result<Vec<_>> = multi.remove_file("/absent").try_collect().await;
    let err = result.expect_err("first key must fail");
    assert!(err.is_operation_error());
    assert_eq!(transport.operation_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_session_ops_through_aggregate() -> Result<()> {
    let transport = MockTransport::new();
    let multi = MultiConnection::open(["h1"], mock_factory(&transport, 3))?;

    let session = multi.get("h1")?;
    session.create_dir_all(Path::new("/srv/app")).await?;
    session.write(Path::new("/srv/app/config"), Bytes::from("x=1")).await?;
    assert!(session.is_file(Path::new("/srv/app/config")).await?);
    assert_eq!(transport.file("/srv/app/config"), Some(Bytes::from("x=1")));
    Ok(())
}
