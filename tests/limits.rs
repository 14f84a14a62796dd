
use chunkledger::accounting::engine::{
    CopyNodeOptions, CreateNodeOptions, MoveNodeOptions, WriteOptions,
};
use chunkledger::accounting::errors::AccountingError;
use chunkledger::accounting::tree::NodeType;
use test_helpers::*;

#[test]
fn test_node_count_limit_validation() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().node_count);

    engine.set_node_count_limit("max", 1000).unwrap();
    engine.set_node_count_limit("max", 2000).unwrap();
    engine.set_node_count_limit("max", 0).unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().node_count);

    assert!(matches!(
        engine.set_node_count_limit("max", -1),
        Err(AccountingError::Validation { .. })
    ));
}

#[test]
fn test_node_count_limit_checked_synchronously() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/t", CreateNodeOptions::default())
        .unwrap();
    engine.write("/tmp/t", &[100], WriteOptions::default()).unwrap();

    engine.set_node_count_limit("max", 0).unwrap();
    assert!(matches!(
        engine.set_node_account("/tmp/t", "max", None, None),
        Err(AccountingError::QuotaExceeded { .. })
    ));
    assert_eq!(engine.node_account("/tmp/t").unwrap(), "tmp");
}

#[test]
fn test_node_count_limit_blocks_copy() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/a", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/a", "max", None, None).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/a/t1", CreateNodeOptions::default())
        .unwrap();
    engine
        .write("/tmp/a/t1", &[100], WriteOptions::default())
        .unwrap();
    engine.run_sweep();

    let node_count = account_node_count(&engine, "max");
    engine.set_node_count_limit("max", node_count).unwrap();

    // Node count usage is checked synchronously.
    assert!(matches!(
        engine.copy_node("/tmp/a/t1", "/tmp/a/t2", Default::default()),
        Err(AccountingError::QuotaExceeded { .. })
    ));
}

#[test]
fn test_chunk_count_limit_validation() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().chunk_count);

    engine.set_chunk_count_limit("max", 1000).unwrap();
    engine.set_chunk_count_limit("max", 2000).unwrap();
    engine.set_chunk_count_limit("max", 0).unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().chunk_count);

    assert!(matches!(
        engine.set_chunk_count_limit("max", -1),
        Err(AccountingError::Validation { .. })
    ));
}

#[test]
fn test_chunk_count_limits_with_sharing() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/a", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/a", "max", None, None).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/a/t1", CreateNodeOptions::default())
        .unwrap();
    engine
        .write("/tmp/a/t1", &[100], WriteOptions::default())
        .unwrap();
    engine.run_sweep();

    engine.set_chunk_count_limit("max", 1).unwrap();

    // Copying a chunk the account already owns stays within the quota.
    engine
        .copy_node("/tmp/a/t1", "/tmp/a/t2", Default::default())
        .unwrap();
    engine.run_sweep();
    assert_eq!(account_chunk_count(&engine, "max"), 1);

    engine
        .create_node(NodeType::Table, "/tmp/t", CreateNodeOptions::default())
        .unwrap();
    engine.write("/tmp/t", &[100], WriteOptions::default()).unwrap();

    // A foreign chunk admitted without the pessimistic check pushes the
    // account over its limit once the requisition update lands.
    engine
        .copy_node(
            "/tmp/t",
            "/tmp/a/t3",
            CopyNodeOptions {
                pessimistic_quota_check: false,
                ..Default::default()
            },
        )
        .unwrap();
    engine.run_sweep();
    assert_eq!(account_chunk_count(&engine, "max"), 2);
    assert!(engine.violated_resource_limits("max").unwrap().chunk_count);

    // New chunk creation is checked synchronously and fails now.
    engine
        .create_node(NodeType::Table, "/tmp/a/t4", CreateNodeOptions::default())
        .unwrap();
    assert!(matches!(
        engine.write("/tmp/a/t4", &[100], WriteOptions::default()),
        Err(AccountingError::QuotaExceeded { .. })
    ));
}

#[test]
fn test_disk_space_limit_validation() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().disk_space);

    engine.set_disk_space_limit("max", "default", 1000).unwrap();
    engine.set_disk_space_limit("max", "default", 2000).unwrap();
    engine.set_disk_space_limit("max", "default", 0).unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().disk_space);

    assert!(matches!(
        engine.set_disk_space_limit("max", "default", -1),
        Err(AccountingError::Validation { .. })
    ));
}

#[test]
fn test_disk_space_checked_asynchronously() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .set_disk_space_limit("max", "default", 1_000_000)
        .unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/t", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/t", "max", None, None).unwrap();
    engine.write("/tmp/t", &[100], WriteOptions::default()).unwrap();
    engine.run_sweep();
    assert!(!engine.violated_resource_limits("max").unwrap().disk_space);

    // Lowering the limit below usage is legal and flips the predicate
    // without reclaiming anything.
    engine.set_disk_space_limit("max", "default", 0).unwrap();
    assert!(engine.violated_resource_limits("max").unwrap().disk_space);
    assert_eq!(account_disk_space(&engine, "max"), 300);

    // New writes are rejected while the violation stands.
    assert!(matches!(
        engine.write("/tmp/t", &[100], WriteOptions::default()),
        Err(AccountingError::StaleStateViolation { .. })
    ));

    let usage = account_disk_space(&engine, "max");
    engine
        .set_disk_space_limit("max", "default", usage + 1)
        .unwrap();
    assert!(!engine.violated_resource_limits("max").unwrap().disk_space);

    // A write that overshoots the barely raised limit is admitted, and the
    // sweep flags the account afterwards.
    engine
        .write(
            "/tmp/t",
            &[100],
            WriteOptions {
                transaction: None,
                append: true,
            },
        )
        .unwrap();
    engine.run_sweep();
    assert!(engine.violated_resource_limits("max").unwrap().disk_space);
}

#[test]
fn test_pending_upload_aborted_on_violation() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .set_disk_space_limit("max", "default", 1_000_000)
        .unwrap();
    engine
        .create_node(
            NodeType::File,
            "/tmp/f",
            CreateNodeOptions {
                account: Some("max"),
                transaction: None,
            },
        )
        .unwrap();
    engine.write("/tmp/f", &[100], WriteOptions::default()).unwrap();
    engine.run_sweep();

    let upload = engine
        .begin_upload(
            "/tmp/f",
            WriteOptions {
                transaction: None,
                append: true,
            },
        )
        .unwrap();
    engine.upload_write(&upload, 100).unwrap();
    assert_eq!(engine.node_locks("/tmp/f").unwrap().len(), 1);

    engine.set_disk_space_limit("max", "default", 0).unwrap();
    engine.run_sweep();

    // The platform aborts the pending upload; the lock disappears.
    assert!(engine.node_locks("/tmp/f").unwrap().is_empty());
    assert!(matches!(
        engine.finish_upload(&upload),
        Err(AccountingError::NotFound { .. })
    ));
    assert_eq!(account_disk_space(&engine, "max"), 300);
    assert_eq!(engine.events(Some("max"), Some("upload_aborted"), 10).len(), 1);
}

#[test]
fn test_pessimistic_copy_disk_space_check() {
    let mut engine = setup_test_engine();
    engine.create_account("max").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/a", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/a", "max", None, None).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/a/t1", CreateNodeOptions::default())
        .unwrap();
    engine
        .write("/tmp/a/t1", &[100], WriteOptions::default())
        .unwrap();
    engine.run_sweep();
    let disk_space = account_disk_space(&engine, "max");
    engine
        .set_disk_space_limit("max", "default", disk_space)
        .unwrap();

    // Sharing already-owned chunks fits the limit exactly.
    engine
        .copy_node("/tmp/a/t1", "/tmp/a/t2", Default::default())
        .unwrap();
    engine.run_sweep();
    assert_eq!(account_disk_space(&engine, "max"), disk_space);

    engine
        .create_node(NodeType::Table, "/tmp/t", CreateNodeOptions::default())
        .unwrap();
    engine.write("/tmp/t", &[100], WriteOptions::default()).unwrap();

    // Foreign chunks do not fit and are rejected up front...
    assert!(matches!(
        engine.copy_node("/tmp/t", "/tmp/a/t3", Default::default()),
        Err(AccountingError::QuotaExceeded { .. })
    ));

    // ...unless the pessimistic check is waived, after which the account is
    // merely flagged.
    engine
        .copy_node(
            "/tmp/t",
            "/tmp/a/t3",
            CopyNodeOptions {
                pessimistic_quota_check: false,
                ..Default::default()
            },
        )
        .unwrap();
    engine.run_sweep();
    assert_eq!(account_disk_space(&engine, "max"), 2 * disk_space);
    assert!(engine.violated_resource_limits("max").unwrap().disk_space);

    engine
        .create_node(NodeType::Table, "/tmp/a/t4", CreateNodeOptions::default())
        .unwrap();
    assert!(matches!(
        engine.write("/tmp/a/t4", &[100], WriteOptions::default()),
        Err(AccountingError::StaleStateViolation { .. })
    ));
}

#[test]
fn test_quota_boundary() {
    let mut engine = setup_test_engine();
    engine.create_account("a").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/q", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/q", "a", None, None).unwrap();

    // Limit equal to usage admits nothing further.
    engine.set_node_count_limit("a", 1).unwrap();
    assert!(matches!(
        engine.create_node(NodeType::Table, "/tmp/q/t1", CreateNodeOptions::default()),
        Err(AccountingError::QuotaExceeded { .. })
    ));

    // Limit of usage + 1 admits exactly one more.
    engine.set_node_count_limit("a", 2).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/q/t1", CreateNodeOptions::default())
        .unwrap();
    assert!(matches!(
        engine.create_node(NodeType::Table, "/tmp/q/t2", CreateNodeOptions::default()),
        Err(AccountingError::QuotaExceeded { .. })
    ));
}

#[test]
fn test_branched_nodes_not_counted_against_quota() {
    let mut engine = setup_test_engine();
    engine
        .create_node(NodeType::Table, "/tmp/t", CreateNodeOptions::default())
        .unwrap();
    engine.run_sweep();
    let mut node_count = account_node_count(&engine, "tmp");
    let mut committed_node_count = engine.committed_resource_usage("tmp").unwrap().node_count;

    let tx1 = engine.start_transaction(None).unwrap();
    engine
        .copy_node(
            "/tmp/t",
            "/tmp/t1",
            CopyNodeOptions {
                transaction: Some(tx1),
                ..Default::default()
            },
        )
        .unwrap();
    node_count += 3;
    committed_node_count += 1;
    assert_eq!(account_node_count(&engine, "tmp"), node_count);
    assert_eq!(
        engine.committed_resource_usage("tmp").unwrap().node_count,
        committed_node_count
    );

    engine
        .copy_node(
            "/tmp/t",
            "/tmp/t2",
            CopyNodeOptions {
                transaction: Some(tx1),
                ..Default::default()
            },
        )
        .unwrap();
    node_count += 2;
    committed_node_count += 1;
    assert_eq!(account_node_count(&engine, "tmp"), node_count);
    assert_eq!(
        engine.committed_resource_usage("tmp").unwrap().node_count,
        committed_node_count
    );

    // The limit is compared against committed usage, so branches do not
    // count.
    engine
        .set_node_count_limit("tmp", committed_node_count)
        .unwrap();
    assert!(matches!(
        engine.copy_node(
            "/tmp/t",
            "/tmp/t3",
            CopyNodeOptions {
                transaction: Some(tx1),
                ..Default::default()
            },
        ),
        Err(AccountingError::QuotaExceeded { .. })
    ));

    engine
        .set_node_count_limit("tmp", committed_node_count + 1)
        .unwrap();
    engine
        .copy_node(
            "/tmp/t",
            "/tmp/t3",
            CopyNodeOptions {
                transaction: Some(tx1),
                ..Default::default()
            },
        )
        .unwrap();
    node_count += 2;
    committed_node_count += 1;
    assert_eq!(account_node_count(&engine, "tmp"), node_count);
    assert_eq!(
        engine.committed_resource_usage("tmp").unwrap().node_count,
        committed_node_count
    );

    engine.set_node_count_limit("tmp", node_count + 2).unwrap();
    engine
        .copy_node(
            "/tmp/t",
            "/tmp/t4",
            CopyNodeOptions {
                transaction: Some(tx1),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(account_node_count(&engine, "tmp"), node_count + 2);
    assert_eq!(
        engine.committed_resource_usage("tmp").unwrap().node_count,
        committed_node_count + 1
    );
}

#[test]
fn test_move_preserve_account_succeeds_when_overcommitted() {
    let mut engine = setup_test_engine();
    engine.create_account("a").unwrap();
    engine
        .set_disk_space_limit("a", "default", 100_000)
        .unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/x", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/x", "a", None, None).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/x/t", CreateNodeOptions::default())
        .unwrap();
    engine.write("/tmp/x/t", &[100], WriteOptions::default()).unwrap();
    engine.run_sweep();

    engine.set_resource_limits("a", zero_limits()).unwrap();

    engine
        .move_node(
            "/tmp/x",
            "/tmp/y",
            MoveNodeOptions {
                preserve_account: true,
            },
        )
        .unwrap();
    assert_eq!(engine.node_account("/tmp/y").unwrap(), "a");
    assert!(!engine.node_exists("/tmp/x"));
}

#[test]
fn test_move_into_same_account_succeeds_when_overcommitted() {
    let mut engine = setup_test_engine();
    engine.create_account("a").unwrap();
    engine
        .set_disk_space_limit("a", "default", 100_000)
        .unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/x", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/x", "a", None, None).unwrap();
    engine
        .create_node(NodeType::Table, "/tmp/x/t", CreateNodeOptions::default())
        .unwrap();
    engine.write("/tmp/x/t", &[100], WriteOptions::default()).unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/for_y", CreateNodeOptions::default())
        .unwrap();
    engine
        .set_node_account("/tmp/for_y", "a", None, None)
        .unwrap();
    engine.run_sweep();

    engine.set_resource_limits("a", zero_limits()).unwrap();

    // No account changes hands, so no quota check applies.
    engine
        .move_node(
            "/tmp/x",
            "/tmp/for_y/y",
            MoveNodeOptions {
                preserve_account: false,
            },
        )
        .unwrap();
}

#[test]
fn test_move_into_overcommitted_account_fails() {
    let mut engine = setup_test_engine();
    engine.create_account("a").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/x", CreateNodeOptions::default())
        .unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/for_y", CreateNodeOptions::default())
        .unwrap();
    engine
        .set_node_account("/tmp/for_y", "a", None, None)
        .unwrap();

    engine.set_resource_limits("a", zero_limits()).unwrap();

    assert!(matches!(
        engine.move_node(
            "/tmp/x",
            "/tmp/for_y/y",
            MoveNodeOptions {
                preserve_account: false,
            },
        ),
        Err(AccountingError::QuotaExceeded { .. })
    ));
    assert!(engine.node_exists("/tmp/x"));
}

#[test]
fn test_copy_into_overcommitted_account_fails() {
    let mut engine = setup_test_engine();
    engine.create_account("a").unwrap();
    engine
        .create_node(NodeType::MapNode, "/tmp/x", CreateNodeOptions::default())
        .unwrap();
    engine.set_node_account("/tmp/x", "a", None, None).unwrap();

    engine.set_resource_limits("a", zero_limits()).unwrap();

    assert!(matches!(
        engine.copy_node(
            "/tmp/x",
            "/tmp/y",
            CopyNodeOptions {
                preserve_account: true,
                ..Default::default()
            },
        ),
        Err(AccountingError::QuotaExceeded { .. })
    ));
    assert!(!engine.node_exists("/tmp/y"));
}
